// CLI module for gencache
// Author: kelexine (https://github.com/kelexine)

use crate::cache::ParamValue;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// gencache - inspect and maintain the persistent generation cache
#[derive(Parser, Debug)]
#[command(name = "gencache", version, about, long_about = None)]
pub struct Args {
    /// Config file (default: ~/.gencache/config.toml)
    #[arg(long, global = true, env = "GENCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Treat the cache as disabled for this invocation
    #[arg(long, global = true)]
    pub no_cache: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show store usage
    Stats {
        /// Print Prometheus text exposition instead of JSON
        #[arg(long)]
        metrics: bool,
    },

    /// Remove every cached entry
    Clear,

    /// Remove one cached entry
    Delete {
        /// 64-character hex fingerprint
        fingerprint: String,
    },

    /// Compute the fingerprint of a request without generating anything
    Fingerprint {
        /// Model identifier
        #[arg(long)]
        model: String,
        /// Operation name
        #[arg(long)]
        op: String,
        /// Parameter as key=value, or key:int=value / key:float=value / key:bool=value
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, ParamValue)>,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Parses `key=value` (a string) or `key:type=value`.
pub fn parse_param(raw: &str) -> Result<(String, ParamValue), String> {
    let (lhs, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;

    let (key, kind) = match lhs.split_once(':') {
        Some((key, kind)) => (key, kind),
        None => (lhs, "str"),
    };
    if key.is_empty() {
        return Err(format!("missing parameter name in '{}'", raw));
    }

    let value = match kind {
        "str" | "string" => ParamValue::Str(value.to_string()),
        "int" => value
            .parse::<i64>()
            .map(ParamValue::Int)
            .map_err(|e| format!("{}: {}", key, e))?,
        "float" => {
            let v = value
                .parse::<f64>()
                .map_err(|e| format!("{}: {}", key, e))?;
            if !v.is_finite() {
                return Err(format!("{}: float must be finite", key));
            }
            ParamValue::Float(v)
        }
        "bool" => value
            .parse::<bool>()
            .map(ParamValue::Bool)
            .map_err(|e| format!("{}: {}", key, e))?,
        other => return Err(format!("unknown parameter type '{}'", other)),
    };

    Ok((key.to_string(), value))
}
