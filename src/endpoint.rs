/*
 * Copyright 2020 Joyent, Inc.
 */

use std::fmt;

use serde_derive::Deserialize;
use sha1::Sha1;

use crate::config::MonitorOptions;

pub type EndpointPort = u16;
pub type EndpointName = String;

/// A remote backend server, sharable by many connections. Admission
/// counters are keyed by this address/port pair, not by full connection
/// identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: EndpointPort,
}

impl Endpoint {
    pub fn new(host: &str, port: EndpointPort) -> Self {
        Endpoint {
            host: String::from(host),
            port,
        }
    }

    pub fn name(&self) -> EndpointName {
        [self.host.clone(), String::from(":"), self.port.to_string()]
            .concat()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.name())
    }
}

/// One configured relationship from a local federated table to one remote
/// backend table. Carries everything a connection key or a monitor needs.
#[derive(Clone, Debug, Deserialize)]
pub struct LinkTarget {
    pub host: String,
    pub port: EndpointPort,
    pub username: String,
    pub password: String,
    /// Protocol family of the remote driver, e.g. "mysql".
    pub wrapper: String,
    pub remote_db: String,
    pub remote_table: String,
    pub link_idx: usize,
    /// Scheduling weight; orders siblings in the connection tree.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub monitoring: Option<MonitorOptions>,
}

impl LinkTarget {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port)
    }

    /// The remote path this link routes to, used by loop-check
    /// fingerprints.
    pub fn remote_path(&self) -> String {
        [
            self.remote_db.clone(),
            String::from("."),
            self.remote_table.clone(),
        ]
        .concat()
    }
}

/// Opaque connection identity: host, port, credentials, protocol family
/// and link index, NUL-joined. Only equality and hashing are meaningful;
/// nothing parses a key back apart.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnKey(String);

impl ConnKey {
    pub fn for_link(target: &LinkTarget) -> Self {
        ConnKey(
            [
                target.host.clone(),
                target.port.to_string(),
                target.username.clone(),
                target.password.clone(),
                target.wrapper.clone(),
                target.link_idx.to_string(),
            ]
            .join("\u{0}"),
        )
    }

    /// A short stable fingerprint safe for logging (the raw key embeds
    /// credentials).
    pub fn fingerprint(&self) -> String {
        let mut sha1 = Sha1::new();
        sha1.update(self.0.as_bytes());
        base64::encode(&sha1.digest().bytes())
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.fingerprint())
    }
}
