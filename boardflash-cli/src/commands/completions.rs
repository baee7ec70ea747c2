//! Shell completion scripts: print to stdout or install for the current user.

use anyhow::{Context, Result, bail};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use rust_i18n::t;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN: &str = "boardflash";
const ZSH_FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

/// Print the completion script for `shell`.
pub(crate) fn cmd_completions(shell: Shell) {
    write_script(shell, &mut io::stdout());
}

fn write_script(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN, out);
}

/// Where a user-level completion script for `shell` is picked up.
fn install_path(shell: Shell, dirs: &BaseDirs) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_local_dir()
            .join("bash-completion/completions")
            .join(BIN),
        Shell::Zsh => dirs.home_dir().join(".zfunc").join(format!("_{BIN}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish/completions")
            .join(format!("{BIN}.fish")),
        Shell::Elvish => dirs.config_dir().join("elvish/lib").join(format!("{BIN}.elv")),
        Shell::PowerShell => match std::env::var_os("PROFILE") {
            Some(profile) => Path::new(&profile)
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
                .join(format!("{BIN}.ps1")),
            None => dirs
                .config_dir()
                .join("powershell/completions")
                .join(format!("{BIN}.ps1")),
        },
        other => bail!(t!("completions.unsupported", shell = other.to_string()).to_string()),
    };
    Ok(path)
}

/// Install completions for `shell_arg` (or the shell in `$SHELL`).
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = shell_arg
        .or_else(Shell::from_env)
        .with_context(|| t!("completions.detect_failed").to_string())?;
    let dirs = BaseDirs::new().context(t!("completions.no_home").to_string())?;
    let path = install_path(shell, &dirs)?;

    let mut script = Vec::new();
    write_script(shell, &mut script);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &script)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} {}",
        style("✓").green().bold(),
        t!(
            "completions.installed",
            shell = style(shell.to_string()).cyan().to_string(),
            path = style(path.display()).yellow().to_string()
        )
    );

    match shell {
        Shell::Zsh => {
            let zshrc = dirs.home_dir().join(".zshrc");
            if ensure_zsh_fpath(&zshrc)? {
                eprintln!(
                    "{} {}",
                    style("✓").green().bold(),
                    t!("completions.zsh_fpath_added", file = zshrc.display().to_string())
                );
            }
            eprintln!("{}", t!("completions.hint_zsh"));
        },
        Shell::Bash => eprintln!(
            "{}",
            t!("completions.hint_bash", path = path.display().to_string())
        ),
        Shell::PowerShell => eprintln!(
            "{}",
            t!("completions.hint_powershell", path = path.display().to_string())
        ),
        _ => eprintln!("{}", t!("completions.hint_auto")),
    }
    Ok(())
}

/// Make sure `~/.zfunc` is on zsh's `fpath`. Returns whether `zshrc` changed.
fn ensure_zsh_fpath(zshrc: &Path) -> Result<bool> {
    let existing = fs::read_to_string(zshrc).unwrap_or_default();
    if existing.contains(ZSH_FPATH_LINE) {
        return Ok(false);
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN} completions")?;
    writeln!(file, "{ZSH_FPATH_LINE}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    Ok(true)
}
