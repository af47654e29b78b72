use thiserror::Error;

/// Unified error type for the tunnel daemon.
///
/// Mirrors the teacher's `DatabaseError` split: one variant per error kind
/// with a human-readable message, `#[from]` only where a source error type
/// is always worth preserving verbatim.
#[derive(Error, Debug)]
pub enum MoguraError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read private key file: {0}")]
    KeyFileRead(String),

    #[error("failed to parse private key: {0}")]
    KeyParse(String),

    #[error("SSH dial failed: {0}")]
    SshDial(String),

    #[error("local listener bind failed: {0}")]
    ListenerBind(String),

    #[error("SSH channel open failed: {0}")]
    ChannelOpen(String),

    #[error("forwarding administratively prohibited: {0}")]
    ForwardingProhibited(String),

    #[error("DNS query failed: {0}")]
    DnsQuery(String),

    #[error("DNS response parse error: {0}")]
    DnsParse(String),

    #[error("DNS answer section was empty for {0}")]
    DnsEmptyAnswer(String),

    #[error("target validation failed: {0}")]
    TargetValidation(String),

    #[error("target resolution failed: {0}")]
    TargetResolve(String),

    #[error("hosted-zone provider error: {0}")]
    HostedZone(String),

    #[error("unknown hosted zone id: {0}")]
    UnknownZone(String),

    #[error("unknown hosted-zone record name: {0}")]
    UnknownZoneName(String),

    #[error("accept failed: {0}")]
    AcceptFailed(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("forward copy failed: {0}")]
    CopyFailed(String),

    #[error("close failed: {0}")]
    CloseFailed(String),

    #[error("resolver failed: {0}")]
    ResolverFailed(String),

    #[error("resolver retry threshold exceeded: {0}")]
    ResolverRetryThresholdExceeded(String),

    #[error("SSH reconnect failed: {0}")]
    SshReconnectFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type MoguraResult<T> = Result<T, MoguraError>;
