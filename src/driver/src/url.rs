use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use percent_encoding::percent_decode_str;

use crate::error::{Result, SqlError};
use crate::options::Options;

pub const DEFAULT_PORT: u16 = 3306;

/// High-availability policy selected from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaMode {
    None,
    LoadBalance,
    Sequential,
    Replication,
    Aurora,
}

impl HaMode {
    fn from_scheme_suffix(suffix: &str) -> Result<HaMode> {
        match suffix {
            "" => Ok(HaMode::None),
            "loadbalance" => Ok(HaMode::LoadBalance),
            "sequential" => Ok(HaMode::Sequential),
            "replication" => Ok(HaMode::Replication),
            "aurora" => Ok(HaMode::Aurora),
            other => Err(SqlError::parse(
                format!("wrong failover parameter format in connection String '{other}'"),
                0,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Tcp,
    Unix,
    Pipe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
    pub transport: TransportType,
    pub master: bool,
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed connection URL: HA mode, ordered host list, database and the
/// frozen option record.
#[derive(Debug, Clone)]
pub struct UrlParser {
    initial_url: String,
    ha_mode: HaMode,
    hosts: Vec<HostAddress>,
    database: Option<String>,
    options: Arc<Options>,
    normalized_properties: String,
}

impl UrlParser {
    /// Accepts `jdbc:{mariadb|mysql}[:<hamode>]://host[:port][,host2…]/[db][?k=v&…]`
    /// and the bare `host[:port][/db][?…]` form, which is normalized by
    /// prepending `jdbc:mariadb://`.
    pub fn parse(url: &str, properties: &BTreeMap<String, String>) -> Result<UrlParser> {
        let normalized = if url.starts_with("jdbc:") {
            url.to_string()
        } else {
            format!("jdbc:mariadb://{url}")
        };
        let without_prefix = normalized.strip_prefix("jdbc:").unwrap();

        let separator = without_prefix.find("://").ok_or_else(|| {
            SqlError::parse(format!("invalid connection URL '{url}'"), 0)
        })?;
        let scheme = &without_prefix[..separator];
        let rest = &without_prefix[separator + 3..];

        let (vendor, ha_suffix) = match scheme.split_once(':') {
            Some((vendor, suffix)) => (vendor, suffix),
            None => (scheme, ""),
        };
        if vendor != "mariadb" && vendor != "mysql" {
            return Err(SqlError::parse(
                format!("invalid connection URL scheme 'jdbc:{scheme}'"),
                0,
            ));
        }
        let ha_mode = HaMode::from_scheme_suffix(ha_suffix)?;

        let (authority, tail) = match rest.find(['/', '?']) {
            Some(pos) if rest.as_bytes()[pos] == b'/' => (&rest[..pos], &rest[pos + 1..]),
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };
        let (database, query) = match tail.find('?') {
            Some(pos) => (&tail[..pos], &tail[pos + 1..]),
            None => (tail, ""),
        };
        let database = match database {
            "" => None,
            db => Some(db.to_string()),
        };

        let mut merged = parse_query_pairs(query)?;
        for (k, v) in properties {
            merged.insert(k.clone(), v.clone());
        }
        let normalized_properties = Options::normalized_form(&merged);
        let options = Arc::new(Options::parse(&merged)?);

        let hosts = parse_hosts(authority, ha_mode)?;
        if hosts.is_empty() {
            return Err(SqlError::parse(
                format!("no host defined in connection URL '{url}'"),
                0,
            ));
        }

        Ok(UrlParser {
            initial_url: normalized,
            ha_mode,
            hosts,
            database,
            options,
            normalized_properties,
        })
    }

    pub fn initial_url(&self) -> &str {
        &self.initial_url
    }

    pub fn ha_mode(&self) -> HaMode {
        self.ha_mode
    }

    pub fn hosts(&self) -> &[HostAddress] {
        &self.hosts
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    /// Identity of the pool serving this URL: endpoint plus the semantic
    /// property subset, canonically ordered.
    pub fn pool_key(&self) -> String {
        let hosts = self.hosts.iter().map(|h| h.to_string()).join(",");
        format!(
            "{}://{}/{}?{}",
            self.ha_mode_scheme(),
            hosts,
            self.database.as_deref().unwrap_or(""),
            self.normalized_properties
        )
    }

    fn ha_mode_scheme(&self) -> &'static str {
        match self.ha_mode {
            HaMode::None => "mariadb",
            HaMode::LoadBalance => "mariadb:loadbalance",
            HaMode::Sequential => "mariadb:sequential",
            HaMode::Replication => "mariadb:replication",
            HaMode::Aurora => "mariadb:aurora",
        }
    }
}

fn parse_query_pairs(query: &str) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for item in query.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = item.split_once('=').unwrap_or((item, ""));
        let key = percent_decode_str(key)
            .decode_utf8()
            .map_err(|_| SqlError::parse(format!("invalid URL parameter '{item}'"), 0))?;
        let value = percent_decode_str(value)
            .decode_utf8()
            .map_err(|_| SqlError::parse(format!("invalid URL parameter '{item}'"), 0))?;
        pairs.insert(key.into_owned(), value.into_owned());
    }
    Ok(pairs)
}

fn parse_hosts(authority: &str, ha_mode: HaMode) -> Result<Vec<HostAddress>> {
    let mut hosts = Vec::new();
    for (index, part) in authority.split(',').filter(|s| !s.is_empty()).enumerate() {
        let (transport, endpoint) = if let Some(rest) = part.strip_prefix("pipe:") {
            (TransportType::Pipe, rest)
        } else if let Some(rest) = part.strip_prefix("unix:") {
            (TransportType::Unix, rest)
        } else if let Some(rest) = part.strip_prefix("tcp:") {
            (TransportType::Tcp, rest)
        } else {
            (TransportType::Tcp, part)
        };

        let (host, port) = match endpoint.rsplit_once(':') {
            Some((host, port)) if transport == TransportType::Tcp => {
                let port = port.parse::<u16>().map_err(|_| {
                    SqlError::parse(format!("invalid port in host '{part}'"), 0)
                })?;
                (host, port)
            }
            _ => (endpoint, DEFAULT_PORT),
        };

        // in replication mode the first host is the master, the rest replicas
        let master = ha_mode != HaMode::Replication || index == 0;
        hosts.push(HostAddress {
            host: host.to_string(),
            port,
            transport,
            master,
        });
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_props() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    pub fn test_simple_url() {
        let url = UrlParser::parse("jdbc:mariadb://localhost/test", &no_props()).unwrap();
        assert_eq!(url.ha_mode(), HaMode::None);
        assert_eq!(url.hosts().len(), 1);
        assert_eq!(url.hosts()[0].host, "localhost");
        assert_eq!(url.hosts()[0].port, 3306);
        assert_eq!(url.database(), Some("test"));
    }

    #[test]
    pub fn test_bare_host_normalized() {
        let url = UrlParser::parse("db1:3307/prod?user=app", &no_props()).unwrap();
        assert_eq!(url.initial_url(), "jdbc:mariadb://db1:3307/prod?user=app");
        assert_eq!(url.hosts()[0].port, 3307);
        assert_eq!(url.options().user.as_deref(), Some("app"));
    }

    #[test]
    pub fn test_multi_host_ha_modes() {
        let url = UrlParser::parse(
            "jdbc:mariadb:loadbalance://h1,h2:3310/test",
            &no_props(),
        )
        .unwrap();
        assert_eq!(url.ha_mode(), HaMode::LoadBalance);
        assert_eq!(url.hosts().len(), 2);
        assert_eq!(url.hosts()[1].port, 3310);
        assert!(url.hosts().iter().all(|h| h.master));

        let url =
            UrlParser::parse("jdbc:mysql:replication://m,r1,r2/test", &no_props()).unwrap();
        assert_eq!(url.ha_mode(), HaMode::Replication);
        assert!(url.hosts()[0].master);
        assert!(!url.hosts()[1].master);
        assert!(!url.hosts()[2].master);
    }

    #[test]
    pub fn test_transport_prefixes() {
        let url = UrlParser::parse(
            "jdbc:mariadb://unix:/var/run/mysqld/mysqld.sock/test",
            &no_props(),
        )
        .unwrap();
        assert_eq!(url.hosts()[0].transport, TransportType::Unix);
        assert_eq!(url.hosts()[0].host, "/var/run/mysqld/mysqld.sock");
    }

    #[test]
    pub fn test_query_options_decoded() {
        let url = UrlParser::parse(
            "jdbc:mariadb://localhost/test?user=ro%40ot&useServerPrepStmts=true",
            &no_props(),
        )
        .unwrap();
        assert_eq!(url.options().user.as_deref(), Some("ro@ot"));
        assert!(url.options().use_server_prep_stmts);
    }

    #[test]
    pub fn test_properties_override_query() {
        let mut props = BTreeMap::new();
        props.insert("user".to_string(), "override".to_string());
        let url = UrlParser::parse("jdbc:mariadb://localhost/test?user=query", &props).unwrap();
        assert_eq!(url.options().user.as_deref(), Some("override"));
    }

    #[test]
    pub fn test_pool_key_ignores_password() {
        let mut a = BTreeMap::new();
        a.insert("user".to_string(), "root".to_string());
        a.insert("password".to_string(), "one".to_string());
        let mut b = a.clone();
        b.insert("password".to_string(), "two".to_string());
        let key_a = UrlParser::parse("jdbc:mariadb://h/test", &a).unwrap().pool_key();
        let key_b = UrlParser::parse("jdbc:mariadb://h/test", &b).unwrap().pool_key();
        assert_eq!(key_a, key_b);
    }

    #[test]
    pub fn test_invalid_urls() {
        assert!(UrlParser::parse("jdbc:postgres://h/test", &no_props()).is_err());
        assert!(UrlParser::parse("jdbc:mariadb:cluster://h/test", &no_props()).is_err());
        assert!(UrlParser::parse("jdbc:mariadb://", &no_props()).is_err());
    }
}
