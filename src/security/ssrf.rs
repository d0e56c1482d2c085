//! # 出站地址校验（SSRF 防护）
//!
//! 每次连接上游之前都要经过这里：协议、主机黑名单、DNS 解析后的全部地址、
//! 默认禁止网段、可选白名单。重定向不由传输层自动跟随，每一跳都重新校验。

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use url::{Host, Url};

use crate::config::SsrfConfig;
use crate::error::{GatewayError, Result, SsrfError};

/// 默认禁止的网段
const DEFAULT_BLOCKED_CIDRS: &[&str] = &[
    // IPv4
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    // IPv6
    "::/128",
    "::1/128",
    "::ffff:0:0/96",
    "64:ff9b::/96",
    "100::/64",
    "2001::/32",
    "2001:db8::/32",
    "2002::/16",
    "fc00::/7",
    "fe80::/10",
    "fec0::/10",
    "ff00::/8",
];

/// 云厂商元数据服务等禁止访问的主机名
const DEFAULT_BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.com",
    "instance-data",
    "instance-data.ec2.internal",
    "169.254.169.254",
    "169.254.170.2",
    "100.100.100.200",
    "fd00:ec2::254",
];

/// 元数据服务地址，不受 `exempt_cidrs` 与白名单影响
const METADATA_ADDRS: &[IpAddr] = &[
    IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)),
    IpAddr::V4(Ipv4Addr::new(169, 254, 170, 2)),
    IpAddr::V4(Ipv4Addr::new(100, 100, 100, 200)),
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254)),
];

/// DNS 解析
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// 系统解析器
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok(tokio::net::lookup_host((host, port))
            .await?
            .map(|addr| addr.ip())
            .collect())
    }
}

/// 固定映射解析器，未知主机解析失败
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    #[must_use]
    pub fn with(mut self, host: &str, ips: &[&str]) -> Self {
        let ips = ips.iter().filter_map(|ip| ip.parse().ok()).collect();
        self.entries.insert(host.to_ascii_lowercase(), ips);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        self.entries.get(host).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no entry for {host}"))
        })
    }
}

#[derive(Debug, Clone)]
enum AllowRule {
    Host(String),
    Suffix(String),
    Net(IpNetwork),
}

/// 出站地址校验器
pub struct SsrfGuard {
    enabled: bool,
    blocked_hosts: HashSet<String>,
    blocked_nets: Vec<IpNetwork>,
    exempt_nets: Vec<IpNetwork>,
    allowlist: Vec<AllowRule>,
    max_redirects: usize,
    resolver: Arc<dyn Resolver>,
}

impl std::fmt::Debug for SsrfGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsrfGuard")
            .field("enabled", &self.enabled)
            .field("allowlist", &self.allowlist.len())
            .field("max_redirects", &self.max_redirects)
            .finish_non_exhaustive()
    }
}

fn parse_nets(entries: &[String], what: &str) -> Result<Vec<IpNetwork>> {
    entries
        .iter()
        .map(|s| {
            s.parse::<IpNetwork>()
                .map_err(|e| GatewayError::config_with_source(format!("invalid {what} '{s}'"), e))
        })
        .collect()
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

impl SsrfGuard {
    pub fn new(config: &SsrfConfig, resolver: Arc<dyn Resolver>) -> Result<Self> {
        let blocked_nets = DEFAULT_BLOCKED_CIDRS
            .iter()
            .map(|s| {
                s.parse::<IpNetwork>()
                    .map_err(|e| GatewayError::internal_with_source("bad builtin cidr", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut blocked_hosts: HashSet<String> =
            DEFAULT_BLOCKED_HOSTS.iter().map(|h| (*h).to_string()).collect();
        blocked_hosts.extend(config.blocked_hosts.iter().map(|h| normalize_host(h)));

        let allowlist = config
            .allowlist
            .iter()
            .map(|entry| {
                if let Ok(net) = entry.parse::<IpNetwork>() {
                    AllowRule::Net(net)
                } else if let Some(suffix) = entry.strip_prefix("*.") {
                    AllowRule::Suffix(normalize_host(suffix))
                } else {
                    AllowRule::Host(normalize_host(entry))
                }
            })
            .collect();

        Ok(Self {
            enabled: config.enabled,
            blocked_hosts,
            blocked_nets,
            exempt_nets: parse_nets(&config.exempt_cidrs, "ssrf exempt cidr")?,
            allowlist,
            max_redirects: config.max_redirects,
            resolver,
        })
    }

    #[must_use]
    pub const fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    fn is_blocked_host(&self, host: &str) -> bool {
        self.blocked_hosts.contains(host) || host.ends_with(".localhost")
    }

    /// 地址是否落在禁止网段内（IPv4 映射地址按内嵌 IPv4 再判一次）
    fn is_blocked_ip(&self, ip: IpAddr) -> bool {
        let embedded = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
            IpAddr::V4(_) => None,
        };
        let effective = embedded.unwrap_or(ip);
        if METADATA_ADDRS.contains(&effective) {
            return true;
        }
        if self.exempt_nets.iter().any(|net| net.contains(effective)) {
            return false;
        }
        self.blocked_nets
            .iter()
            .any(|net| net.contains(ip) || embedded.is_some_and(|v4| net.contains(v4)))
    }

    fn allowlisted(&self, host: &str, ips: &[IpAddr]) -> bool {
        if self.allowlist.is_empty() {
            return true;
        }
        self.allowlist.iter().any(|rule| match rule {
            AllowRule::Host(h) => h == host,
            AllowRule::Suffix(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
            AllowRule::Net(net) => !ips.is_empty() && ips.iter().all(|ip| net.contains(*ip)),
        })
    }

    /// 校验一个出站 URL
    pub async fn validate_url(&self, raw: &str) -> std::result::Result<Url, SsrfError> {
        let url = Url::parse(raw).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;
        self.validate(url).await
    }

    /// 校验已解析的 URL
    pub async fn validate(&self, url: Url) -> std::result::Result<Url, SsrfError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SsrfError::SchemeNotAllowed(url.scheme().to_string()));
        }
        if !self.enabled {
            return Ok(url);
        }

        let host = url
            .host()
            .ok_or_else(|| SsrfError::InvalidUrl("missing host".to_string()))?;
        let (host_name, literal) = match host {
            Host::Domain(d) => (normalize_host(d), None),
            Host::Ipv4(v4) => (v4.to_string(), Some(IpAddr::V4(v4))),
            Host::Ipv6(v6) => (v6.to_string(), Some(IpAddr::V6(v6))),
        };

        if self.is_blocked_host(&host_name) {
            return Err(SsrfError::BlockedHost(host_name));
        }

        let ips = match literal {
            Some(ip) => vec![ip],
            None => {
                let port = url.port_or_known_default().unwrap_or(443);
                let ips = self
                    .resolver
                    .resolve(&host_name, port)
                    .await
                    .map_err(|_| SsrfError::ResolutionFailed(host_name.clone()))?;
                if ips.is_empty() {
                    return Err(SsrfError::ResolutionFailed(host_name));
                }
                ips
            }
        };

        if let Some(ip) = ips.iter().copied().find(|ip| self.is_blocked_ip(*ip)) {
            return Err(SsrfError::BlockedAddress {
                host: host_name,
                ip,
            });
        }

        if !self.allowlisted(&host_name, &ips) {
            return Err(SsrfError::NotAllowlisted(host_name));
        }

        Ok(url)
    }

    /// 校验重定向目标，`hop` 为已跟随的跳数
    pub async fn validate_redirect(
        &self,
        current: &Url,
        location: &str,
        hop: usize,
    ) -> std::result::Result<Url, SsrfError> {
        if hop >= self.max_redirects {
            return Err(SsrfError::TooManyRedirects(self.max_redirects));
        }
        let next = current
            .join(location)
            .map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;
        self.validate(next).await
    }
}
