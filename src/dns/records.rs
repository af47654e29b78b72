use crate::error::MoguraError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ARecord {
    pub ttl: u32,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub ttl: u32,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnameRecord {
    pub ttl: u32,
    pub target: String,
}

/// Collapses runs of whitespace to single spaces, matching the
/// normalization step the DNS parsing contract assumes.
fn normalize(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_u32(token: &str, what: &str) -> Result<u32, MoguraError> {
    token
        .parse::<u32>()
        .map_err(|_| MoguraError::DnsParse(format!("non-numeric {}: {}", what, token)))
}

fn parse_u16(token: &str, what: &str) -> Result<u16, MoguraError> {
    token
        .parse::<u16>()
        .map_err(|_| MoguraError::DnsParse(format!("non-numeric {}: {}", what, token)))
}

/// Parses a presentation-format A answer line (`name. TTL IN A addr`).
///
/// Deliberately redundant with `hickory_proto`'s already-typed answer: the
/// decoded record is re-stringified and re-parsed token by token, matching
/// the original implementation's double-conversion behavior.
pub fn parse_a(line: &str) -> Result<ARecord, MoguraError> {
    let normalized = normalize(line);
    let tokens: Vec<&str> = normalized.split(' ').collect();
    if tokens.len() != 5 {
        return Err(MoguraError::DnsParse(format!(
            "expected 5 tokens in A answer, got {}: {}",
            tokens.len(),
            line
        )));
    }
    let ttl = parse_u32(tokens[1], "TTL")?;
    Ok(ARecord {
        ttl,
        address: tokens[4].to_string(),
    })
}

/// Parses a presentation-format SRV answer line
/// (`name. TTL IN SRV priority weight port target.`).
pub fn parse_srv(line: &str) -> Result<SrvRecord, MoguraError> {
    let normalized = normalize(line);
    let tokens: Vec<&str> = normalized.split(' ').collect();
    if tokens.len() != 8 {
        return Err(MoguraError::DnsParse(format!(
            "expected 8 tokens in SRV answer, got {}: {}",
            tokens.len(),
            line
        )));
    }
    let ttl = parse_u32(tokens[1], "TTL")?;
    let priority = parse_u16(tokens[4], "priority")?;
    let weight = parse_u16(tokens[5], "weight")?;
    let port = parse_u16(tokens[6], "port")?;
    Ok(SrvRecord {
        ttl,
        priority,
        weight,
        port,
        target: tokens[7].to_string(),
    })
}

/// Parses a presentation-format CNAME answer line (`name. TTL IN CNAME target.`).
pub fn parse_cname(line: &str) -> Result<CnameRecord, MoguraError> {
    let normalized = normalize(line);
    let tokens: Vec<&str> = normalized.split(' ').collect();
    if tokens.len() != 5 {
        return Err(MoguraError::DnsParse(format!(
            "expected 5 tokens in CNAME answer, got {}: {}",
            tokens.len(),
            line
        )));
    }
    let ttl = parse_u32(tokens[1], "TTL")?;
    Ok(CnameRecord {
        ttl,
        target: tokens[4].to_string(),
    })
}
