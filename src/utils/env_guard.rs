use std::fs;
use std::path::Path;

fn write_minimal_env_template(file: &mut fs::File) -> std::io::Result<()> {
    use std::io::Write;
    writeln!(file, "# BWORK aggregator (read-only) configuration")?;
    writeln!(file)?;
    writeln!(file, "BWORK_RPC_URL=\"https://mainnet.base.org\"")?;
    writeln!(file, "BWORK_ETH_RPC_URL=\"\"")?;
    writeln!(file, "BWORK_TOKEN_ADDRESS=\"0xCHANGE_ME\"")?;
    writeln!(file, "BWORK_DATA_SOURCE_URL=\"\"")?;
    writeln!(file, "BWORK_BACKUP_DATA_SOURCE_URL=\"\"")?;
    writeln!(file, "BWORK_CACHE_DB=\"bwork_cache.db\"")?;
    writeln!(file, "BWORK_KNOWN_MINERS_FILE=\"\"")?;
    writeln!(file)?;
    writeln!(file, "RUST_LOG=\"info,bwork_aggregator=info\"")?;
    Ok(())
}

fn strip_quotes(value: &str) -> &str {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// `KEY=value` pairs from dotenv text; comments, blanks and malformed lines are skipped.
pub fn parse_dot_env(content: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value_no_comment = value.split('#').next().unwrap_or("").trim();
        out.push((key.to_string(), strip_quotes(value_no_comment).to_string()));
    }
    out
}

fn load_dot_env() {
    let path = Path::new(".env");
    if !path.exists() {
        return;
    }

    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[ENV] Failed to read .env: {}", e);
            return;
        }
    };

    for (key, value) in parse_dot_env(&content) {
        if std::env::var_os(&key).is_some() {
            continue;
        }
        std::env::set_var(key, value);
    }
}

fn ensure_env_example_exists() {
    let env_example = Path::new(".env.example");
    if env_example.exists() {
        return;
    }
    if let Ok(mut file) = fs::File::create(env_example) {
        let _ = write_minimal_env_template(&mut file);
    }
}

/// Load `.env` without overriding the process environment and leave a template behind.
pub fn harden_env_setup() {
    ensure_env_example_exists();
    load_dot_env();
    if std::env::var("BWORK_RPC_URL").is_err() {
        eprintln!("[ENV] WARN: BWORK_RPC_URL is not set");
    }
    if std::env::var("BWORK_TOKEN_ADDRESS").is_err() {
        eprintln!("[ENV] WARN: BWORK_TOKEN_ADDRESS is not set");
    }
}
