use std::io;

const DEV_PATH: &str = "/dev";
const RUN_PATH: &str = "/run/udev";
const SYS_CONF_DIR: &str = "/etc";
const DEFAULT_CONFIG_FILE: &str = const_format::concatcp!(SYS_CONF_DIR, "/udev/udev.conf");

/// Library context: where the udev runtime lives on this host, plus the
/// log level monitors created from it apply to the `log` facade.
#[derive(Debug)]
pub struct Udev {
    dev_path: String,
    run_path: String,
    log_priority: LogPriority,
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogPriority {
    Error,
    Info,
    #[default]
    Debug,
}

impl LogPriority {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "err" => Self::Error,
            "info" => Self::Info,
            "debug" => Self::Debug,
            _ => return None,
        })
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
        }
    }
}

impl Udev {
    /// Reads the udev configuration file (path overridable via
    /// `UDEV_CONFIG_FILE`). A `UDEV_LOG` environment variable takes
    /// precedence over the file's `udev_log` key; a missing file and
    /// unknown keys fall back to the defaults.
    pub fn new() -> io::Result<Self> {
        let config_path = std::env::var_os("UDEV_CONFIG_FILE")
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());

        let mut this = Self {
            dev_path: DEV_PATH.to_owned(),
            run_path: RUN_PATH.to_owned(),
            log_priority: LogPriority::default(),
        };

        match std::fs::read_to_string(&config_path) {
            Ok(config) => {
                for line in config.lines() {
                    let Some((key, value)) = config_pair(line) else {
                        continue;
                    };

                    match key {
                        "udev_log" => {
                            if let Some(priority) = LogPriority::from_name(value) {
                                this.log_priority = priority;
                            }
                        }
                        "udev_root" => this.dev_path = value.to_owned(),
                        "udev_run" => this.run_path = value.to_owned(),
                        // unknown key
                        _ => continue,
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => return Err(err),
        }

        if let Some(priority) = std::env::var("UDEV_LOG")
            .ok()
            .and_then(|name| LogPriority::from_name(&name))
        {
            this.log_priority = priority;
        }

        Ok(this)
    }

    pub fn set_log_priority(&mut self, priority: LogPriority) {
        self.log_priority = priority;
    }

    pub fn get_log_priority(&self) -> LogPriority {
        self.log_priority
    }

    pub fn dev_path(&self) -> &str {
        &self.dev_path
    }

    pub fn run_path(&self) -> &str {
        &self.run_path
    }
}

/// Splits one configuration line into a key/value pair. Comments, blank
/// lines, mismatched quotes, and empty values yield nothing.
fn config_pair(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let mut value = value.trim();

    if let Some(quote) = value.chars().next().filter(|&ch| ch == '"' || ch == '\'') {
        value = value.strip_prefix(quote)?.strip_suffix(quote)?;
    }

    if value.is_empty() {
        return None;
    }
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_line_parsing() {
        assert_eq!(config_pair("udev_log=info"), Some(("udev_log", "info")));
        assert_eq!(
            config_pair("  udev_run = \"/tmp/udev-run\"  "),
            Some(("udev_run", "/tmp/udev-run"))
        );
        assert_eq!(config_pair("udev_run='/tmp/udev-run'"), Some(("udev_run", "/tmp/udev-run")));
        assert_eq!(config_pair("# comment"), None);
        assert_eq!(config_pair("   "), None);
        assert_eq!(config_pair("no_equals_sign"), None);
        assert_eq!(config_pair("broken_quote=\"x"), None);
        assert_eq!(config_pair("empty=\"\""), None);
    }

    // one test so the UDEV_CONFIG_FILE mutations stay sequential
    #[test]
    fn configuration_file_handling() {
        let path = std::env::temp_dir().join(format!("udev-conf-{}", std::process::id()));
        std::fs::write(
            &path,
            "# comment\nudev_log=info\nudev_run=\"/tmp/udev-run\"\nbogus=1\n",
        )
        .unwrap();

        std::env::remove_var("UDEV_LOG");
        std::env::set_var("UDEV_CONFIG_FILE", &path);
        let mut udev = Udev::new().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(udev.get_log_priority(), LogPriority::Info);
        assert_eq!(udev.run_path(), "/tmp/udev-run");
        assert_eq!(udev.dev_path(), "/dev");

        udev.set_log_priority(LogPriority::Error);
        assert_eq!(
            udev.get_log_priority().to_level_filter(),
            log::LevelFilter::Error
        );

        // a missing file falls back to the defaults
        std::env::set_var("UDEV_CONFIG_FILE", "/nonexistent/udev.conf");
        let udev = Udev::new().unwrap();
        std::env::remove_var("UDEV_CONFIG_FILE");

        assert_eq!(udev.run_path(), "/run/udev");
        assert_eq!(udev.get_log_priority(), LogPriority::Debug);
    }
}
