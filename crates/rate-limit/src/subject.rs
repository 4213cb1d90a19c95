use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;

use ipnet::Ipv6Net;

/// Who a check is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    /// An authenticated user id, resolved upstream.
    User(String),
    /// No user id: keyed by session or client address.
    Anonymous(String),
}

impl Subject {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    /// IPv4 addresses are used as-is. IPv6 clients usually own a whole /64,
    /// so the key is the /64 network rather than the individual address.
    pub fn anonymous_ip(addr: IpAddr) -> Self {
        let key = match addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => Ipv6Net::new(v6, 64)
                .map(|net| net.trunc().to_string())
                .unwrap_or_else(|_| v6.to_string()),
        };
        Self::Anonymous(format!("ip:{}", key))
    }

    pub fn anonymous_session(session_id: &str) -> Self {
        Self::Anonymous(format!("session:{}", session_id))
    }

    /// Pick the most specific identity available.
    pub fn resolve(user_id: Option<&str>, session_id: Option<&str>, client_ip: Option<IpAddr>) -> Self {
        if let Some(id) = user_id.map(str::trim).filter(|id| !id.is_empty()) {
            return Self::user(id);
        }
        if let Some(session) = session_id.map(str::trim).filter(|s| !s.is_empty()) {
            return Self::anonymous_session(session);
        }
        match client_ip {
            Some(addr) => Self::anonymous_ip(addr),
            None => Self::Anonymous("unknown".to_string()),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(id) => Some(id),
            Self::Anonymous(_) => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }

    /// Unit of quota isolation: `user:<id>|<endpoint>` or
    /// `anon:<key>|<endpoint>`, with `|` and `\` escaped in both parts so
    /// distinct pairs never share a key.
    pub fn key(&self, endpoint: &str) -> String {
        let (tag, id) = match self {
            Self::User(id) => ("user", id),
            Self::Anonymous(key) => ("anon", key),
        };
        format!("{}:{}|{}", tag, escape(id), escape(endpoint))
    }
}

fn escape(part: &str) -> Cow<'_, str> {
    if part.contains(['|', '\\']) {
        Cow::Owned(part.replace('\\', "\\\\").replace('|', "\\|"))
    } else {
        Cow::Borrowed(part)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => f.write_str(id),
            Self::Anonymous(key) => write!(f, "anon:{}", key),
        }
    }
}
