//! `lightflow config` scaffolding commands

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Subcommand;

use lightflow::config::Config;

/// Bundled example workflow files, copied by `config examples`
const EXAMPLES: &[(&str, &str)] = &[
    ("hello.yaml", include_str!("../../demos/hello.yaml")),
    ("fanout.yaml", include_str!("../../demos/fanout.yaml")),
    ("subdag.yaml", include_str!("../../demos/subdag.yaml")),
];

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Write the default configuration to <dir>/lightflow.cfg
    Default {
        /// Target directory (created if missing)
        dir: PathBuf,
    },

    /// Copy the bundled example workflows into <dir>
    Examples {
        /// Target directory (created if missing)
        dir: PathBuf,
    },
}

pub async fn run(command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Default { dir } => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
            let path = dir.join("lightflow.cfg");
            std::fs::write(&path, Config::default_yaml())
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        ConfigCommand::Examples { dir } => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
            for (name, contents) in EXAMPLES {
                let path = dir.join(name);
                std::fs::write(&path, contents)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("wrote {}", path.display());
            }
        }
    }
    Ok(())
}
