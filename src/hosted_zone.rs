use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_route53::Client;
use tokio::sync::Mutex;

use crate::error::{MoguraError, MoguraResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Srv,
}

#[derive(Debug, Clone)]
pub struct ZoneRecord {
    pub record_type: RecordType,
    pub values: Vec<String>,
    pub ttl: i64,
}

/// Pluggable hosted-zone lookup, `resolve(zone_id, name) -> ZoneRecord`.
#[async_trait]
pub trait HostedZoneResolver: Send + Sync {
    async fn resolve(&self, zone_id: &str, name: &str) -> MoguraResult<ZoneRecord>;
}

type ZoneCache = HashMap<String, HashMap<String, ZoneRecord>>;

/// AWS Route 53-backed resolver. Lists every private hosted zone and its
/// record sets on first use, keeping only A/AAAA/CNAME/SRV records in an
/// in-memory cache keyed `zone_id -> name -> record`. Re-population is out
/// of scope (see DESIGN.md).
pub struct Route53Resolver {
    client: Client,
    cache: Mutex<Option<ZoneCache>>,
}

impl Route53Resolver {
    pub async fn new() -> MoguraResult<Self> {
        let region = std::env::var("MOGURA_ROUTE53_REGION")
            .map_err(|_| MoguraError::Config("MOGURA_ROUTE53_REGION is not set".to_string()))?;
        let shared_config = aws_config::from_env()
            .region(aws_sdk_route53::config::Region::new(region))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&shared_config),
            cache: Mutex::new(None),
        })
    }

    async fn load(&self) -> MoguraResult<ZoneCache> {
        let mut cache = ZoneCache::new();

        let zones = self
            .client
            .list_hosted_zones()
            .send()
            .await
            .map_err(|e| MoguraError::HostedZone(e.to_string()))?;

        for zone in zones.hosted_zones() {
            let is_private = zone.config().and_then(|c| c.private_zone).unwrap_or(false);
            if !is_private {
                continue;
            }
            let zone_id = zone.id().to_string();

            let record_sets = self
                .client
                .list_resource_record_sets()
                .hosted_zone_id(&zone_id)
                .send()
                .await
                .map_err(|e| MoguraError::HostedZone(e.to_string()))?;

            let mut by_name = HashMap::new();
            for rrset in record_sets.resource_record_sets() {
                let record_type = match rrset.r#type() {
                    aws_sdk_route53::types::RrType::A => RecordType::A,
                    aws_sdk_route53::types::RrType::Aaaa => RecordType::Aaaa,
                    aws_sdk_route53::types::RrType::Cname => RecordType::Cname,
                    aws_sdk_route53::types::RrType::Srv => RecordType::Srv,
                    _ => continue,
                };

                let values: Vec<String> = rrset
                    .resource_records()
                    .iter()
                    .filter_map(|r| r.value.clone())
                    .collect();

                by_name.insert(
                    rrset.name().to_string(),
                    ZoneRecord {
                        record_type,
                        values,
                        ttl: rrset.ttl().unwrap_or(0),
                    },
                );
            }

            cache.insert(zone_id, by_name);
        }

        Ok(cache)
    }
}

#[async_trait]
impl HostedZoneResolver for Route53Resolver {
    async fn resolve(&self, zone_id: &str, name: &str) -> MoguraResult<ZoneRecord> {
        let mut cache_guard = self.cache.lock().await;
        if cache_guard.is_none() {
            *cache_guard = Some(self.load().await?);
        }
        let cache = cache_guard.as_ref().expect("cache populated above");

        let zone = cache
            .get(zone_id)
            .ok_or_else(|| MoguraError::UnknownZone(zone_id.to_string()))?;
        zone.get(name)
            .cloned()
            .ok_or_else(|| MoguraError::UnknownZoneName(name.to_string()))
    }
}

/// In-memory stub used by `Target` unit tests and as a template for
/// additional hosted-zone backends.
pub struct StaticResolver {
    records: HashMap<(String, String), ZoneRecord>,
}

impl StaticResolver {
    pub fn new(records: HashMap<(String, String), ZoneRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl HostedZoneResolver for StaticResolver {
    async fn resolve(&self, zone_id: &str, name: &str) -> MoguraResult<ZoneRecord> {
        self.records
            .get(&(zone_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| MoguraError::UnknownZoneName(name.to_string()))
    }
}

pub type SharedHostedZoneResolver = Arc<dyn HostedZoneResolver>;
