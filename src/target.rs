use std::sync::Arc;
use std::time::Instant;

use log::info;
use russh::client::Handle;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::credentials::BastionHandler;
use crate::dns::DnsClient;
use crate::error::{MoguraError, MoguraResult};
use crate::hosted_zone::SharedHostedZoneResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    HostPort,
    Srv,
    CnameSrv,
    Route53,
}

impl Default for TargetType {
    fn default() -> Self {
        TargetType::HostPort
    }
}

/// Mirrors the original's `switch t.TargetType { case "SRV": ...; case
/// "HOST-PORT": fallthrough; default: ... }`: a missing or unrecognized
/// value is treated as HOST-PORT rather than rejected.
impl<'de> Deserialize<'de> for TargetType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "SRV" => TargetType::Srv,
            "CNAME-SRV" => TargetType::CnameSrv,
            "ROUTE53" => TargetType::Route53,
            _ => TargetType::HostPort,
        })
    }
}

/// Mutable runtime state for a tunnel's remote endpoint: the immutable spec
/// fields plus the last resolution's `(host, port)` pair.
///
/// Mutated only by the periodic resolver task of the owning engine; the
/// accept task only ever reads `resolved_host`/`resolved_port`.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub target_type: TargetType,
    pub target: String,
    pub target_port: u16,
    pub resolved_host: String,
    pub resolved_port: u16,
    pub last_change: Option<Instant>,
}

impl Target {
    pub fn new(name: &str, target_type: TargetType, target: &str, target_port: u16) -> MoguraResult<Self> {
        let t = Self {
            name: name.to_string(),
            target_type,
            target: target.to_string(),
            target_port,
            resolved_host: String::new(),
            resolved_port: 0,
            last_change: None,
        };
        t.validate()?;
        Ok(t)
    }

    /// Pre-start validation: target non-empty, and `target_port`
    /// zero/non-zero matches the target type's requirement.
    pub fn validate(&self) -> MoguraResult<()> {
        if self.target.is_empty() {
            return Err(MoguraError::TargetValidation(format!(
                "tunnel {}: target must not be empty",
                self.name
            )));
        }

        match self.target_type {
            TargetType::Srv | TargetType::CnameSrv => {
                if self.target_port != 0 {
                    return Err(MoguraError::TargetValidation(format!(
                        "tunnel {}: target_port must be zero for SRV/CNAME-SRV",
                        self.name
                    )));
                }
            }
            TargetType::HostPort => {
                if self.target_port == 0 {
                    return Err(MoguraError::TargetValidation(format!(
                        "tunnel {}: target_port must be non-zero for HOST-PORT",
                        self.name
                    )));
                }
            }
            TargetType::Route53 => {}
        }

        Ok(())
    }

    /// Resolves the target to a concrete `(host, port)` pair, atomically
    /// replacing `resolved_host`/`resolved_port` only when the pair changes,
    /// and logging only on that change.
    pub async fn resolve(
        &mut self,
        session: &Arc<Mutex<Handle<BastionHandler>>>,
        dns: Option<&DnsClient>,
        hosted_zone: Option<&SharedHostedZoneResolver>,
    ) -> MoguraResult<()> {
        let (host, port) = match self.target_type {
            TargetType::HostPort => (self.target.clone(), self.target_port),
            TargetType::Srv => {
                let dns = dns.ok_or_else(|| {
                    MoguraError::TargetResolve(format!(
                        "tunnel {}: SRV target requires remote_dns",
                        self.name
                    ))
                })?;
                self.resolve_srv(dns, session, &self.target.clone()).await?
            }
            TargetType::CnameSrv => {
                let dns = dns.ok_or_else(|| {
                    MoguraError::TargetResolve(format!(
                        "tunnel {}: CNAME-SRV target requires remote_dns",
                        self.name
                    ))
                })?;
                let cnames = dns.query_cname(session, &self.target).await?;
                let cname = cnames.first().ok_or_else(|| {
                    MoguraError::TargetResolve(format!("tunnel {}: empty CNAME answer", self.name))
                })?;
                self.resolve_srv(dns, session, &cname.target).await?
            }
            TargetType::Route53 => {
                let (zone_id, name) = self.target.split_once(':').ok_or_else(|| {
                    MoguraError::TargetResolve(format!(
                        "tunnel {}: ROUTE53 target must be zone_id:name",
                        self.name
                    ))
                })?;
                let resolver = hosted_zone.ok_or_else(|| {
                    MoguraError::TargetResolve(format!(
                        "tunnel {}: ROUTE53 target requires a hosted-zone resolver",
                        self.name
                    ))
                })?;
                let record = resolver.resolve(zone_id, name).await?;
                if record.record_type != crate::hosted_zone::RecordType::A {
                    return Err(MoguraError::TargetResolve(format!(
                        "tunnel {}: ROUTE53 CNAME/SRV records are not supported",
                        self.name
                    )));
                }
                let address = record.values.first().ok_or_else(|| {
                    MoguraError::TargetResolve(format!(
                        "tunnel {}: empty ROUTE53 record set",
                        self.name
                    ))
                })?;
                (address.clone(), self.target_port)
            }
        };

        if host != self.resolved_host || port != self.resolved_port {
            info!(
                target: "mogura::target",
                "tunnel {}: remote changed {}:{} -> {}:{}",
                self.name, self.resolved_host, self.resolved_port, host, port
            );
            self.resolved_host = host;
            self.resolved_port = port;
            self.last_change = Some(Instant::now());
        }

        Ok(())
    }

    async fn resolve_srv(
        &self,
        dns: &DnsClient,
        session: &Arc<Mutex<Handle<BastionHandler>>>,
        srv_name: &str,
    ) -> MoguraResult<(String, u16)> {
        let srv_records = dns.query_srv(session, srv_name).await?;
        let srv = srv_records.first().ok_or_else(|| {
            MoguraError::TargetResolve(format!("tunnel {}: empty SRV answer", self.name))
        })?;

        let a_records = dns.query_a(session, &srv.target).await?;
        let a = a_records.first().ok_or_else(|| {
            MoguraError::TargetResolve(format!("tunnel {}: empty A answer", self.name))
        })?;

        Ok((a.address.clone(), srv.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_target() {
        let err = Target::new("t", TargetType::HostPort, "", 80).unwrap_err();
        assert!(matches!(err, MoguraError::TargetValidation(_)));
    }

    #[test]
    fn validate_rejects_srv_with_nonzero_port() {
        let err = Target::new("t", TargetType::Srv, "_svc._tcp.example.com", 80).unwrap_err();
        assert!(matches!(err, MoguraError::TargetValidation(_)));
    }

    #[test]
    fn validate_rejects_host_port_with_zero_port() {
        let err = Target::new("t", TargetType::HostPort, "10.0.0.1", 0).unwrap_err();
        assert!(matches!(err, MoguraError::TargetValidation(_)));
    }

    #[test]
    fn validate_accepts_well_formed_host_port() {
        let target = Target::new("t", TargetType::HostPort, "10.0.0.1", 80).unwrap();
        assert_eq!(target.resolved_host, "");
        assert_eq!(target.last_change, None);
    }

    #[test]
    fn validate_accepts_srv_with_zero_port() {
        Target::new("t", TargetType::Srv, "_svc._tcp.example.com", 0).unwrap();
    }

    #[test]
    fn target_type_defaults_to_host_port() {
        assert_eq!(TargetType::default(), TargetType::HostPort);
    }

    #[test]
    fn target_type_deserializes_unrecognized_string_as_host_port() {
        let parsed: TargetType = serde_yaml::from_str("\"NOT-A-REAL-TYPE\"").unwrap();
        assert_eq!(parsed, TargetType::HostPort);
    }

    #[test]
    fn target_type_deserializes_known_variants() {
        assert_eq!(
            serde_yaml::from_str::<TargetType>("SRV").unwrap(),
            TargetType::Srv
        );
        assert_eq!(
            serde_yaml::from_str::<TargetType>("CNAME-SRV").unwrap(),
            TargetType::CnameSrv
        );
        assert_eq!(
            serde_yaml::from_str::<TargetType>("ROUTE53").unwrap(),
            TargetType::Route53
        );
    }
}
