use std::fmt;
use std::path::PathBuf;

/// One engine action. A list of commands runs in order and stops at the first failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `init` against a local plugin directory. Engines before 0.13 also
    /// need plugin fetching switched off explicitly.
    Init {
        plugin_dir: PathBuf,
        get_plugins: bool,
    },
    Apply,
    Destroy,
    Plan,
    Show,
    Import { address: String, id: String },
}

impl Command {
    pub fn init(plugin_dir: impl Into<PathBuf>) -> Self {
        Command::Init {
            plugin_dir: plugin_dir.into(),
            get_plugins: true,
        }
    }

    pub fn init_012(plugin_dir: impl Into<PathBuf>) -> Self {
        Command::Init {
            plugin_dir: plugin_dir.into(),
            get_plugins: false,
        }
    }

    pub fn import(address: impl Into<String>, id: impl Into<String>) -> Self {
        Command::Import {
            address: address.into(),
            id: id.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Apply => "apply",
            Command::Destroy => "destroy",
            Command::Plan => "plan",
            Command::Show => "show",
            Command::Import { .. } => "import",
        }
    }

    /// Arguments passed to the engine binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string()];
        match self {
            Command::Init {
                plugin_dir,
                get_plugins,
            } => {
                args.push("-no-color".to_string());
                if !get_plugins {
                    args.push("-get-plugins=false".to_string());
                }
                args.push(format!("-plugin-dir={}", plugin_dir.display()));
            }
            Command::Apply => args.extend(
                ["-auto-approve", "-input=false", "-no-color"].map(String::from),
            ),
            Command::Destroy => args.extend(["-auto-approve", "-no-color"].map(String::from)),
            Command::Plan | Command::Show => args.push("-no-color".to_string()),
            Command::Import { address, id } => {
                args.push("-no-color".to_string());
                args.push(address.clone());
                args.push(id.clone());
            }
        }
        args
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}
