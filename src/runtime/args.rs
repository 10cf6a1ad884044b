use alloy::primitives::Address;
use std::str::FromStr;

/// What the report binary should do beyond the always-on chart and miner sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeArgs {
    /// Enumerate staked/unstaked positions for this address (`BWORK_REPORT_USER`).
    pub report_user: Option<Address>,
    /// Serve the miner section from the local cache only (`BWORK_SKIP_SCAN`).
    pub skip_scan: bool,
    /// Print the resolved configuration to stderr before running (`BWORK_EXPLAIN_CONFIG`).
    pub explain_config: bool,
}

fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_report_user<F>(lookup: &F) -> anyhow::Result<Option<Address>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("BWORK_REPORT_USER") {
        Some(value) if !value.trim().is_empty() => {
            let trimmed = value.trim();
            let parsed = Address::from_str(trimmed).map_err(|err| {
                anyhow::anyhow!(
                    "invalid BWORK_REPORT_USER '{}': {} (set a valid 0x-prefixed address or leave empty)",
                    trimmed,
                    err
                )
            })?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

fn parse_runtime_args_from<I, S, F>(args: I, lookup: F) -> anyhow::Result<RuntimeArgs>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: Fn(&str) -> Option<String>,
{
    let supplied_args = args
        .into_iter()
        .map(|arg| arg.as_ref().to_string())
        .collect::<Vec<_>>();
    if !supplied_args.is_empty() {
        return Err(anyhow::anyhow!(
            "CLI arguments are not accepted. Configure .env keys instead (BWORK_REPORT_USER, BWORK_SKIP_SCAN, BWORK_EXPLAIN_CONFIG). Received args: {}",
            supplied_args.join(" ")
        ));
    }

    let flag = |key: &str| lookup(key).and_then(|raw| parse_bool_flag(&raw)).unwrap_or(false);
    Ok(RuntimeArgs {
        report_user: parse_report_user(&lookup)?,
        skip_scan: flag("BWORK_SKIP_SCAN"),
        explain_config: flag("BWORK_EXPLAIN_CONFIG"),
    })
}

pub fn parse_runtime_args() -> anyhow::Result<RuntimeArgs> {
    parse_runtime_args_from(std::env::args().skip(1), |key| std::env::var(key).ok())
}
