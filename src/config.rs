//! Server configuration file parsing
//!
//! Grammar: one `key arg...` per line, whitespace separated, `#` starts
//! a comment, double-quoted arguments may use `\n \r \t \' \" \\`
//! escapes. Sizes accept a B/K/M/G/T suffix (powers of 1024). Unknown
//! keys are ignored so configs can be shared across versions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::protocol::DEFAULT_SIZE_LIMIT;

#[derive(Clone, Debug)]
pub struct FcopyConfig {
    pub port: i32,
    pub srv_max_conn: i32,
    pub srv_peer_response_timeout: i32,
    pub srv_receive_timeout: i32,
    pub srv_keep_alive_timeout: i32,
    pub cli_retry_max: i32,
    pub cli_send_timeout: i32,
    pub cli_receive_timeout: i32,
    pub cli_keep_alive_timeout: i32,
    pub request_size_limit: usize,
    pub logfile: String,
    pub pidfile: String,
    pub basedir: String,
    pub default_partition: String,
    /// partition name -> filesystem root
    pub partitions: HashMap<String, PathBuf>,
}

impl Default for FcopyConfig {
    fn default() -> FcopyConfig {
        FcopyConfig {
            port: 0,
            srv_max_conn: 4096,
            srv_peer_response_timeout: 10 * 1000,
            srv_receive_timeout: -1,
            srv_keep_alive_timeout: 300 * 1000,
            cli_retry_max: 3,
            cli_send_timeout: -1,
            cli_receive_timeout: -1,
            cli_keep_alive_timeout: 60 * 1000,
            request_size_limit: DEFAULT_SIZE_LIMIT,
            logfile: String::new(),
            pidfile: String::new(),
            basedir: String::new(),
            default_partition: String::new(),
            partitions: HashMap::new(),
        }
    }
}

fn unescape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, out: &mut String) -> Result<()> {
    loop {
        match chars.next() {
            None => return Err(anyhow!("unterminated quote")),
            Some('"') => return Ok(()),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(c @ ('\'' | '"' | '\\')) => out.push(c),
                _ => return Err(anyhow!("bad escape")),
            },
            Some(c) => out.push(c),
        }
    }
}

/// Split one line into tokens. `Ok(None)` for blank/comment lines.
fn parse_line(line: &str) -> Result<Option<(String, Vec<String>)>> {
    let mut chars = line.chars().peekable();
    let mut tokens: Vec<String> = Vec::new();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.peek() {
            None | Some('#') => break,
            Some('"') => {
                chars.next();
                let mut token = String::new();
                unescape(&mut chars, &mut token)?;
                tokens.push(token);
            }
            Some(_) => {
                let mut token = String::new();
                while let Some(c) = chars.next_if(|&c| !c.is_whitespace() && c != '#') {
                    token.push(c);
                }
                tokens.push(token);
            }
        }
    }

    match tokens.split_first() {
        None => Ok(None),
        Some((key, args)) => Ok(Some((key.clone(), args.to_vec()))),
    }
}

fn parse_int(args: &[String]) -> Result<i32> {
    let [arg] = args else {
        return Err(anyhow!("expected one value"));
    };
    arg.parse().with_context(|| format!("bad integer {:?}", arg))
}

/// `1024`, `64K`, `1.5G`... powers of 1024, fractional values rounded up.
pub fn parse_size(arg: &str) -> Result<usize> {
    let split = arg
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(arg.len());
    let (num, suffix) = arg.split_at(split);

    let value: f64 = num.parse().with_context(|| format!("bad size {:?}", arg))?;
    let shift = match suffix {
        "" | "B" => 0u32,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return Err(anyhow!("bad size suffix {:?}", arg)),
    };

    let value = (value * (1u64 << shift) as f64).ceil();
    if !value.is_finite() || value < 0.0 || value > (1u64 << 50) as f64 {
        return Err(anyhow!("size {:?} out of range", arg));
    }

    Ok(value as usize)
}

fn parse_string(args: &[String]) -> Result<String> {
    let [arg] = args else {
        return Err(anyhow!("expected one value"));
    };
    Ok(arg.clone())
}

impl FcopyConfig {
    fn apply(&mut self, key: &str, args: &[String]) -> Result<()> {
        match key {
            "port" => self.port = parse_int(args)?,
            "srv_max_conn" => self.srv_max_conn = parse_int(args)?,
            "srv-peer-response-timeout" => self.srv_peer_response_timeout = parse_int(args)?,
            "srv-receive-timeout" => self.srv_receive_timeout = parse_int(args)?,
            "srv-keep-alive-timeout" => self.srv_keep_alive_timeout = parse_int(args)?,
            "cli-retry-max" => self.cli_retry_max = parse_int(args)?,
            "cli-send-timeout" => self.cli_send_timeout = parse_int(args)?,
            "cli-receive-timeout" => self.cli_receive_timeout = parse_int(args)?,
            "cli-keep-alive-timeout" => self.cli_keep_alive_timeout = parse_int(args)?,
            "request-size-limit" => {
                let [arg] = args else {
                    return Err(anyhow!("expected one value"));
                };
                self.request_size_limit = parse_size(arg)?;
            }
            "logfile" => self.logfile = parse_string(args)?,
            "pidfile" => self.pidfile = parse_string(args)?,
            "basedir" => self.basedir = parse_string(args)?,
            "default-partition" => self.default_partition = parse_string(args)?,
            "partitions" => {
                let [name, path] = args else {
                    return Err(anyhow!("expected NAME PATH"));
                };
                self.partitions.insert(name.clone(), PathBuf::from(path));
            }
            // Unknown keys are ignored.
            _ => {}
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<FcopyConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("open {}", path.display()))?;

        let mut config = FcopyConfig::default();
        for (lineno, line) in text.lines().enumerate() {
            let parsed = parse_line(line).with_context(|| format!("line {}", lineno + 1))?;
            if let Some((key, args)) = parsed {
                config
                    .apply(&key, &args)
                    .with_context(|| format!("line {} key {:?}", lineno + 1, key))?;
            }
        }

        Ok(config)
    }
}
