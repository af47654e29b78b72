use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{error, info, warn};

use crate::config::{BastionConfig, BastionSpec, TunnelConfig, DEFAULT_FORWARDING_TIMEOUT};
use crate::dns::DnsClient;
use crate::engine::{error_sink, TunnelEngine};
use crate::error::{MoguraError, MoguraResult};
use crate::hosted_zone::{HostedZoneResolver, Route53Resolver, SharedHostedZoneResolver};
use crate::target::{Target, TargetType};

/// Starts/stops a set of tunnels and fans their runtime errors into the
/// system log. One `Supervisor` per daemon process.
pub struct Supervisor {
    engines: HashMap<String, TunnelEngine>,
    drain_handle: tokio::task::JoinHandle<()>,
}

impl Supervisor {
    pub async fn start(bastion_config: &BastionConfig, tunnels: Vec<TunnelConfig>) -> MoguraResult<Self> {
        let bastion = BastionSpec::from_config(bastion_config)?;

        let dns_client = match &bastion.remote_dns {
            Some(remote_dns) => Some(DnsClient::new(remote_dns)?),
            None => None,
        };

        let needs_hosted_zone = tunnels
            .iter()
            .any(|t| t.target_type == TargetType::Route53);
        let hosted_zone: Option<SharedHostedZoneResolver> = if needs_hosted_zone {
            let resolver: Arc<dyn HostedZoneResolver> = Arc::new(Route53Resolver::new().await?);
            Some(resolver)
        } else {
            None
        };

        let (error_tx, mut error_rx) = error_sink();

        let mut engines = HashMap::new();
        let mut used_ports: HashSet<u16> = HashSet::new();

        for tunnel in tunnels {
            if let Err(reason) = validate_tunnel(&tunnel, &bastion, &used_ports) {
                warn!(target: "mogura::supervisor", "skipping tunnel {}: {}", tunnel.name, reason);
                continue;
            }

            let target = match Target::new(
                &tunnel.name,
                tunnel.target_type,
                &tunnel.target,
                tunnel.target_port,
            ) {
                Ok(t) => t,
                Err(e) => {
                    warn!(target: "mogura::supervisor", "skipping tunnel {}: {}", tunnel.name, e);
                    continue;
                }
            };

            let forwarding_timeout = parse_forwarding_timeout(&tunnel);

            match TunnelEngine::start(
                tunnel.name.clone(),
                bastion.clone(),
                tunnel.local_bind_port,
                target,
                forwarding_timeout,
                dns_client.clone(),
                hosted_zone.clone(),
                error_tx.clone(),
            )
            .await
            {
                Ok(engine) => {
                    info!(target: "mogura::supervisor", "tunnel {} started on 127.0.0.1:{}", tunnel.name, tunnel.local_bind_port);
                    used_ports.insert(tunnel.local_bind_port);
                    engines.insert(tunnel.name, engine);
                }
                Err(e) => {
                    error!(target: "mogura::supervisor", "failed to start tunnel {}: {}", tunnel.name, e);
                }
            }
        }

        if engines.is_empty() {
            return Err(MoguraError::Config(
                "no tunnels started; exiting".to_string(),
            ));
        }

        let drain_handle = tokio::spawn(async move {
            while let Some(err) = error_rx.recv().await {
                error!(target: "mogura::engine", "{}", err);
            }
        });

        Ok(Self {
            engines,
            drain_handle,
        })
    }

    /// Waits for an external interrupt (`SIGINT` / Ctrl-C), then closes
    /// every engine and the error-drain task.
    pub async fn run(self) -> MoguraResult<()> {
        let _ = tokio::signal::ctrl_c().await;
        info!(target: "mogura::supervisor", "shutdown signal received, closing tunnels");
        self.close_all().await
    }

    pub async fn close_all(self) -> MoguraResult<()> {
        let mut errors = Vec::new();
        for (name, engine) in self.engines {
            if let Err(e) = engine.close().await {
                errors.push(format!("{}: {}", name, e));
            }
        }
        self.drain_handle.abort();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MoguraError::CloseFailed(errors.join("; ")))
        }
    }
}

fn validate_tunnel(
    tunnel: &TunnelConfig,
    bastion: &BastionSpec,
    used_ports: &HashSet<u16>,
) -> Result<(), String> {
    if tunnel.local_bind_port == 0 {
        return Err("local_bind_port must be non-zero".to_string());
    }
    if used_ports.contains(&tunnel.local_bind_port) {
        return Err(format!(
            "local_bind_port {} is already in use by another tunnel",
            tunnel.local_bind_port
        ));
    }
    if matches!(tunnel.target_type, TargetType::Srv | TargetType::CnameSrv)
        && bastion.remote_dns.is_none()
    {
        return Err("target_type requires bastion.remote_dns to be set".to_string());
    }
    Ok(())
}

fn parse_forwarding_timeout(tunnel: &TunnelConfig) -> std::time::Duration {
    match &tunnel.forwarding_timeout {
        Some(raw) => match humantime::parse_duration(raw) {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    target: "mogura::supervisor",
                    "tunnel {}: invalid forwarding_timeout {:?} ({}), using default",
                    tunnel.name, raw, e
                );
                DEFAULT_FORWARDING_TIMEOUT
            }
        },
        None => DEFAULT_FORWARDING_TIMEOUT,
    }
}
