use anyhow::Result;
use std::path::PathBuf;

pub const DEFAULT_REPORT_HOURS: u64 = 24;

#[derive(Debug, PartialEq, Eq)]
pub enum CliCommand {
    Scan { seconds: Option<u64> },
    List { ignored: bool },
    Ignore { address: String },
    Unignore { address: String },
    Remove { address: String },
    Stats,
    Report { since_hours: u64 },
    PlaySound { address: String },
    Prune,
    Help,
    Version,
}

#[derive(Debug, PartialEq, Eq)]
pub struct CliInvocation {
    /// Use the in-process simulated backend instead of hardware
    pub simulate: bool,
    pub db_path: Option<PathBuf>,
    pub command: CliCommand,
}

pub fn version_text() -> String {
    format!("tracking-detection {}", env!("CARGO_PKG_VERSION"))
}

pub fn usage_text() -> String {
    format!(
        "{version}
Bluetooth tracker detection

Usage:
  tracking-detection [--simulate] [--db <PATH>] scan [--seconds <N>]
  tracking-detection [--db <PATH>] list [--ignored]
  tracking-detection [--db <PATH>] ignore <ADDR>
  tracking-detection [--db <PATH>] unignore <ADDR>
  tracking-detection [--db <PATH>] remove <ADDR>
  tracking-detection [--db <PATH>] stats
  tracking-detection [--db <PATH>] report [--since-hours <N>]
  tracking-detection [--simulate] play-sound <ADDR>
  tracking-detection [--db <PATH>] prune
  tracking-detection --help
  tracking-detection --version

Options:
      --simulate          Use a simulated adapter with demo tags
      --db <PATH>         Database file (default: from settings)
      --seconds <N>       Scan: how long to listen (default: from settings)
      --ignored           List: only ignored devices
      --since-hours <N>   Report: devices first seen in the last N hours (default: {default_hours})
  -h, --help              Show this help text
  -V, --version           Show version",
        version = version_text(),
        default_hours = DEFAULT_REPORT_HOURS,
    )
}

fn parse_u64_arg(flag: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>().ok().filter(|v| *v > 0).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid value for {}: '{}'. Expected a positive integer.\n\n{}",
            flag,
            raw,
            usage_text()
        )
    })
}

fn flag_value<I, S>(flag: &str, inline: Option<&str>, iter: &mut I) -> Result<String>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let value = match inline {
        Some(value) => Some(value.to_string()),
        None => iter.next().map(|v| v.as_ref().to_string()),
    };
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Missing value for {}.\n\n{}", flag, usage_text()))
}

pub fn parse_cli_args<I, S>(args: I) -> Result<CliInvocation>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut iter = args.into_iter();
    let _program_name = iter.next();

    let mut simulate = false;
    let mut db_path: Option<PathBuf> = None;
    let mut command: Option<String> = None;
    let mut address: Option<String> = None;
    let mut seconds: Option<u64> = None;
    let mut since_hours: Option<u64> = None;
    let mut ignored = false;

    while let Some(arg) = iter.next() {
        let arg = arg.as_ref();
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value)),
            _ => (arg, None),
        };

        match flag {
            "-h" | "--help" => {
                return Ok(CliInvocation {
                    simulate,
                    db_path,
                    command: CliCommand::Help,
                })
            }
            "-V" | "--version" => {
                return Ok(CliInvocation {
                    simulate,
                    db_path,
                    command: CliCommand::Version,
                })
            }
            "--simulate" => simulate = true,
            "--ignored" => ignored = true,
            "--db" => db_path = Some(PathBuf::from(flag_value("--db", inline, &mut iter)?)),
            "--seconds" => {
                let raw = flag_value("--seconds", inline, &mut iter)?;
                seconds = Some(parse_u64_arg("--seconds", &raw)?);
            }
            "--since-hours" => {
                let raw = flag_value("--since-hours", inline, &mut iter)?;
                since_hours = Some(parse_u64_arg("--since-hours", &raw)?);
            }
            "scan" | "list" | "ignore" | "unignore" | "remove" | "stats" | "report"
            | "play-sound" | "prune"
                if command.is_none() =>
            {
                command = Some(arg.to_string());
            }
            _ if arg.starts_with('-') => {
                return Err(anyhow::anyhow!(
                    "Unknown argument: {}\n\n{}",
                    arg,
                    usage_text()
                ));
            }
            _ if command.is_some() && address.is_none() => address = Some(arg.to_string()),
            _ => {
                return Err(anyhow::anyhow!(
                    "Unexpected argument: {}\n\n{}",
                    arg,
                    usage_text()
                ));
            }
        }
    }

    let mut take_address = |name: &str| {
        address.take().ok_or_else(|| {
            anyhow::anyhow!("Missing device address for {}.\n\n{}", name, usage_text())
        })
    };

    let command = match command.as_deref() {
        None => CliCommand::Help,
        Some("scan") => CliCommand::Scan { seconds },
        Some("list") => CliCommand::List { ignored },
        Some("ignore") => CliCommand::Ignore {
            address: take_address("ignore")?,
        },
        Some("unignore") => CliCommand::Unignore {
            address: take_address("unignore")?,
        },
        Some("remove") => CliCommand::Remove {
            address: take_address("remove")?,
        },
        Some("play-sound") => CliCommand::PlaySound {
            address: take_address("play-sound")?,
        },
        Some("stats") => CliCommand::Stats,
        Some("report") => CliCommand::Report {
            since_hours: since_hours.unwrap_or(DEFAULT_REPORT_HOURS),
        },
        Some("prune") => CliCommand::Prune,
        Some(other) => {
            return Err(anyhow::anyhow!(
                "Unknown command: {}\n\n{}",
                other,
                usage_text()
            ))
        }
    };

    if let Some(extra) = address {
        return Err(anyhow::anyhow!(
            "Unexpected argument: {}\n\n{}",
            extra,
            usage_text()
        ));
    }

    Ok(CliInvocation {
        simulate,
        db_path,
        command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliInvocation> {
        parse_cli_args(std::iter::once("tracking-detection").chain(args.iter().copied()))
    }

    #[test]
    fn test_no_command_shows_help() {
        assert_eq!(parse(&[]).unwrap().command, CliCommand::Help);
    }

    #[test]
    fn test_scan_with_options() {
        let inv = parse(&["--simulate", "--db", "/tmp/x.db", "scan", "--seconds", "5"]).unwrap();
        assert!(inv.simulate);
        assert_eq!(inv.db_path, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(inv.command, CliCommand::Scan { seconds: Some(5) });
    }

    #[test]
    fn test_inline_flag_values() {
        let inv = parse(&["report", "--since-hours=48"]).unwrap();
        assert_eq!(inv.command, CliCommand::Report { since_hours: 48 });

        let inv = parse(&["report"]).unwrap();
        assert_eq!(
            inv.command,
            CliCommand::Report {
                since_hours: DEFAULT_REPORT_HOURS
            }
        );
    }

    #[test]
    fn test_address_commands() {
        assert_eq!(
            parse(&["ignore", "AA:BB:CC:DD:EE:FF"]).unwrap().command,
            CliCommand::Ignore {
                address: "AA:BB:CC:DD:EE:FF".to_string()
            }
        );
        assert_eq!(
            parse(&["play-sound", "aa:bb:cc:dd:ee:ff"]).unwrap().command,
            CliCommand::PlaySound {
                address: "aa:bb:cc:dd:ee:ff".to_string()
            }
        );
        assert!(parse(&["remove"]).is_err());
        assert!(parse(&["remove", "A", "B"]).is_err());
    }

    #[test]
    fn test_list_ignored() {
        assert_eq!(
            parse(&["list", "--ignored"]).unwrap().command,
            CliCommand::List { ignored: true }
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse(&["scan", "--seconds", "0"]).is_err());
        assert!(parse(&["scan", "--seconds"]).is_err());
        assert!(parse(&["scan", "--bogus"]).is_err());
        assert!(parse(&["launch"]).is_err());
    }

    #[test]
    fn test_help_and_version_short_circuit() {
        assert_eq!(parse(&["scan", "--help"]).unwrap().command, CliCommand::Help);
        assert_eq!(parse(&["-V"]).unwrap().command, CliCommand::Version);
        assert!(usage_text().contains("play-sound"));
    }
}
