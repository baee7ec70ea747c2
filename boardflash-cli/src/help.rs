//! Locale selection and localized help output.
//!
//! clap stays the single source of truth for structure; every user-visible
//! string (headings, command descriptions, argument help) is swapped for its
//! translation at every nesting level (`boardflash esp flash --help` is
//! localized as well as `boardflash --help`).

use clap::CommandFactory;
use rust_i18n::t;

use crate::Cli;

/// Locale from the system settings, or `en` when none is reported.
pub(crate) fn detect_locale() -> &'static str {
    sys_locale::get_locale().map_or("en", |raw| match_locale(&raw))
}

/// Map a POSIX or BCP 47 locale string onto a shipped locale.
///
/// Any Chinese variant (`zh_CN.UTF-8`, `zh-TW`, `zh`) gets `zh-CN`;
/// everything else, `C` and `POSIX` included, gets `en`.
pub(crate) fn match_locale(raw: &str) -> &'static str {
    let language = raw
        .split(['.', '@', '_', '-'])
        .next()
        .unwrap_or_default();
    if language.eq_ignore_ascii_case("zh") {
        "zh-CN"
    } else {
        "en"
    }
}

/// `--lang` value from raw arguments, read before clap so that help output
/// is already localized.
pub(crate) fn early_lang(raw_args: &[String]) -> Option<String> {
    let mut found = None;
    let mut iter = raw_args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--lang=") {
            found = Some(value.to_string());
        } else if arg == "--lang" {
            found = iter.next().cloned();
        }
    }
    found
}

struct Headings {
    args: &'static str,
    opts: &'static str,
    sub_template: String,
}

/// Build the clap `Command` with localized help at every level.
pub(crate) fn build_localized_command() -> clap::Command {
    // Headings must outlive the command; the CLI builds it once per run.
    let headings = Headings {
        args: Box::leak(t!("help.arguments_heading").to_string().into_boxed_str()),
        opts: Box::leak(t!("help.options_heading").to_string().into_boxed_str()),
        sub_template: format!(
            "{{about}}\n\n{usage_h}:\n  {{usage}}\n\n{{all-args}}\n",
            usage_h = t!("help.usage_heading"),
        ),
    };

    let root_template = format!(
        "{{bin}} {{version}}\n\n{{about}}\n\n\
         {usage_h}:\n  {{usage}}\n\n\
         {cmds_h}:\n{{subcommands}}\n\n\
         {opts_h}:\n{{options}}\n\n\
         {{after-help}}\n",
        usage_h = t!("help.usage_heading"),
        cmds_h = t!("help.commands_heading"),
        opts_h = t!("help.options_heading"),
    );

    let root = Cli::command()
        .help_template(root_template)
        .about(t!("app.about").to_string())
        .after_help(t!("app.after_help").to_string())
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            clap::Arg::new("help")
                .short('h')
                .long("help")
                .help(t!("arg.help_flag.help").to_string())
                .action(clap::ArgAction::Help)
                .global(true),
        )
        .arg(
            clap::Arg::new("version")
                .short('V')
                .long("version")
                .help(t!("arg.version_flag.help").to_string())
                .action(clap::ArgAction::Version),
        )
        .mut_args(|arg| place_arg(arg, &headings));

    root.mut_subcommands(|sub| localize_subcommand(sub, "cmd", &headings))
}

fn localize_subcommand(sub: clap::Command, parent_key: &str, headings: &Headings) -> clap::Command {
    let key = format!("{parent_key}.{}", sub.get_name().replace('-', "_"));
    let about_key = format!("{key}.about");
    let localized = t!(&about_key).to_string();
    let sub = if localized != about_key {
        sub.about(localized)
    } else {
        sub
    };
    sub.help_template(headings.sub_template.clone())
        .disable_help_flag(true)
        .mut_args(|arg| place_arg(arg, headings))
        .mut_subcommands(|nested| localize_subcommand(nested, &key, headings))
}

fn place_arg(arg: clap::Arg, headings: &Headings) -> clap::Arg {
    let arg = localize_arg(arg);
    if arg.is_positional() {
        arg.help_heading(headings.args)
    } else {
        arg.help_heading(headings.opts)
    }
}

/// Replace an arg's help text with `arg.<id>.help` when the current locale
/// has it; otherwise keep the doc-comment text.
pub(crate) fn localize_arg(arg: clap::Arg) -> clap::Arg {
    let key = format!("arg.{}.help", arg.get_id());
    let localized = t!(&key).to_string();
    if localized != key {
        arg.help(localized)
    } else {
        arg
    }
}
