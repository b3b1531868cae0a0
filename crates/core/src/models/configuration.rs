use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{FleetError, FleetResult};

/// 配置扫描状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "SCANNING")]
    Scanning,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "ERROR")]
    Error,
}

/// 凭据 + 地址段配置，用于发现并认证Worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub ssh_user: String,
    pub ssh_password: String,
    pub private_key_path: Option<String>,
    pub ip_range: Cidr,
    pub scan_status: ScanStatus,
    pub created_at: DateTime<Utc>,
}

impl Configuration {
    pub fn new(
        id: i64,
        owner: impl Into<String>,
        name: impl Into<String>,
        ssh_user: impl Into<String>,
        ssh_password: impl Into<String>,
        ip_range: Cidr,
    ) -> Self {
        Self {
            id,
            owner: owner.into(),
            name: name.into(),
            ssh_user: ssh_user.into(),
            ssh_password: ssh_password.into(),
            private_key_path: None,
            ip_range,
            scan_status: ScanStatus::New,
            created_at: Utc::now(),
        }
    }
}

/// CIDR地址段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(address: IpAddr, prefix: u8) -> FleetResult<Self> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(FleetError::Configuration(format!(
                "无效的前缀长度 /{prefix}，最大为 /{max}"
            )));
        }

        let network = match address {
            IpAddr::V4(v4) => {
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };

        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        match (self.network, address) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix == 0 { 0 } else { u32::MAX << (32 - self.prefix) };
                u32::from(addr) & mask == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix == 0 { 0 } else { u128::MAX << (128 - self.prefix) };
                u128::from(addr) & mask == u128::from(net)
            }
            _ => false,
        }
    }

    /// 枚举地址段内可用的主机地址
    ///
    /// IPv4前缀小于/31时排除网络地址和广播地址；IPv6排除子网路由器任播地址。
    /// 主机数量超过 `limit` 时返回配置错误。
    pub fn hosts(&self, limit: usize) -> FleetResult<Vec<IpAddr>> {
        let (host_bits, start, skip_first, skip_last): (u32, u128, bool, bool) = match self.network {
            IpAddr::V4(v4) => (
                32 - u32::from(self.prefix),
                u128::from(u32::from(v4)),
                self.prefix < 31,
                self.prefix < 31,
            ),
            IpAddr::V6(v6) => (
                128 - u32::from(self.prefix),
                u128::from(v6),
                self.prefix < 127,
                false,
            ),
        };

        if host_bits >= 64 {
            return Err(FleetError::Configuration(format!(
                "地址段 {self} 过大，无法扫描"
            )));
        }
        let total: u128 = 1u128 << host_bits;
        let first = u128::from(skip_first);
        let last = if skip_last { total - 1 } else { total };
        let count = last.saturating_sub(first);

        if count > limit as u128 {
            return Err(FleetError::Configuration(format!(
                "地址段 {self} 包含 {count} 个主机，超过上限 {limit}"
            )));
        }

        let hosts = (first..last)
            .map(|offset| match self.network {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from((start + offset) as u32)),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(start + offset)),
            })
            .collect();

        Ok(hosts)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let address: IpAddr = addr
            .parse()
            .map_err(|e| FleetError::Configuration(format!("无效的IP地址 {addr}: {e}")))?;
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|e| FleetError::Configuration(format!("无效的前缀长度 {p}: {e}")))?,
            None if address.is_ipv4() => 32,
            None => 128,
        };

        Cidr::new(address, prefix)
    }
}

impl TryFrom<String> for Cidr {
    type Error = FleetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}
