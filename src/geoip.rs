// Geo/VPN signal assembly
//
// Builds the per-session GeoSignal consumed by the quality engine: VPN or
// proxy association, country and UTC offset for timezone-mismatch checks,
// and the referrer domain for blacklist matching. Detection is heuristic
// (hosting/VPN organization keywords); deployments with a MaxMind GeoLite2
// database get real country/timezone resolution behind the `geoip`
// feature.
//
// IPs are never stored raw; only a truncated hash travels with the signal.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Organization-name fragments associated with VPN, proxy, and hosting
/// providers. Residential ISPs never carry these.
const HOSTING_ORG_KEYWORDS: &[&str] = &[
    "vpn",
    "proxy",
    "hosting",
    "datacenter",
    "data center",
    "cloud",
    "digitalocean",
    "ovh",
    "hetzner",
    "amazon",
    "aws",
    "azure",
    "linode",
    "vultr",
    "colocation",
];

/// Geo and network provenance signal for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoSignal {
    /// ISO country code, when resolvable
    pub country: Option<String>,
    /// IANA timezone name, when resolvable
    pub timezone: Option<String>,
    /// UTC offset in minutes for the resolved location
    pub utc_offset_minutes: Option<i32>,
    /// Whether the connection looks like a VPN/proxy/hosting exit
    pub vpn_or_proxy: bool,
    /// Referrer domain, lowercased, when a referrer was present
    pub referrer_domain: Option<String>,
    /// Truncated hash of the client IP
    pub ip_hash: String,
}

/// Heuristic geo/VPN resolver.
///
/// Works from whatever the embedding layer already knows about the
/// connection (reverse-DNS org, referrer header); it performs no network
/// lookups of its own.
#[derive(Debug, Default)]
pub struct GeoResolver;

impl GeoResolver {
    pub fn new() -> Self {
        Self
    }

    /// Assemble the signal for one session.
    pub fn resolve(
        &self,
        client_ip: &str,
        org: Option<&str>,
        referrer: Option<&str>,
    ) -> GeoSignal {
        GeoSignal {
            country: None,
            timezone: None,
            utc_offset_minutes: None,
            vpn_or_proxy: org.map(is_hosting_org).unwrap_or(false),
            referrer_domain: referrer.and_then(extract_domain),
            ip_hash: hash_ip(client_ip),
        }
    }
}

/// Whether an organization name looks like a VPN/proxy/hosting provider.
pub fn is_hosting_org(org: &str) -> bool {
    let lowered = org.to_lowercase();
    HOSTING_ORG_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

/// Pull the host out of a referrer URL or bare domain string.
fn extract_domain(referrer: &str) -> Option<String> {
    if let Ok(parsed) = url::Url::parse(referrer) {
        if let Some(host) = parsed.host_str() {
            return Some(host.to_lowercase());
        }
    }
    let bare = referrer.trim().to_lowercase();
    if bare.is_empty() {
        None
    } else {
        Some(bare)
    }
}

/// Case-insensitive domain/suffix match against a blacklist.
///
/// `ads.suspicious.com` matches a blacklist entry `suspicious.com`;
/// `notsuspicious.com` does not.
pub fn is_blacklisted(domain: &str, blacklist: &[String]) -> bool {
    let domain = domain.to_lowercase();
    blacklist.iter().any(|entry| {
        let entry = entry.to_lowercase();
        domain == entry || domain.ends_with(&format!(".{}", entry))
    })
}

/// Truncated sha256 of the client IP.
fn hash_ip(ip: &str) -> String {
    let hash = Sha256::digest(ip.as_bytes());
    hex::encode(&hash[..8])
}

/// MaxMind-backed resolver for deployments with a GeoLite2 City database.
#[cfg(feature = "geoip")]
pub mod maxmind {
    use super::GeoSignal;
    use anyhow::{Context, Result};
    use std::net::IpAddr;
    use std::path::Path;

    pub struct MaxMindResolver {
        reader: maxminddb::Reader<Vec<u8>>,
    }

    impl MaxMindResolver {
        pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
            let reader = maxminddb::Reader::open_readfile(db_path)
                .context("Failed to open GeoLite2 database")?;
            Ok(Self { reader })
        }

        /// Fill in country/timezone for an already-assembled signal.
        pub fn enrich(&self, signal: &mut GeoSignal, ip: IpAddr) {
            if let Ok(Some(city)) = self.reader.lookup::<maxminddb::geoip2::City>(ip) {
                signal.country = city
                    .country
                    .as_ref()
                    .and_then(|c| c.iso_code)
                    .map(str::to_string);
                signal.timezone = city
                    .location
                    .as_ref()
                    .and_then(|l| l.time_zone)
                    .map(str::to_string);
            }
        }
    }
}
