//! Common data types used by the Avahi D-Bus client.
//!
//! Wire representations follow the Avahi D-Bus API: interface indices and
//! protocols are `i32`, DNS classes and types are `u16`, flags are `u32`.

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// OS dependent index of a network interface.
pub type Interface = i32;

/// "All interfaces".
pub const IF_UNSPEC: Interface = -1;

/// DNS record class (e.g. [`dns_class::IN`]).
pub type RecordClass = u16;

/// DNS record type (e.g. [`dns_type::PTR`]).
pub type RecordType = u16;

/// Raw DNS record data.
pub type RecordData = Vec<u8>;

/// TCP/UDP port of a service.
pub type Port = u16;

/// TXT data of a service, one entry per string.
pub type Txt = Vec<Vec<u8>>;

/// DNS record classes.
pub mod dns_class {
    pub const IN: u16 = 0x01;
    pub const ANY: u16 = 0xFF;
}

/// DNS record types.
pub mod dns_type {
    pub const A: u16 = 0x01;
    pub const NS: u16 = 0x02;
    pub const CNAME: u16 = 0x05;
    pub const SOA: u16 = 0x06;
    pub const PTR: u16 = 0x0C;
    pub const HINFO: u16 = 0x0D;
    pub const MX: u16 = 0x0F;
    pub const TXT: u16 = 0x10;
    pub const AAAA: u16 = 0x1C;
    pub const SRV: u16 = 0x21;
    pub const ANY: u16 = 0xFF;

    /// Parse a record type name ("PTR", "srv", ...) or a decimal number.
    pub fn parse(s: &str) -> Option<u16> {
        let t = match s.to_ascii_uppercase().as_str() {
            "A" => A,
            "NS" => NS,
            "CNAME" => CNAME,
            "SOA" => SOA,
            "PTR" => PTR,
            "HINFO" => HINFO,
            "MX" => MX,
            "TXT" => TXT,
            "AAAA" => AAAA,
            "SRV" => SRV,
            "ANY" => ANY,
            other => return other.parse().ok(),
        };
        Some(t)
    }
}

/// Network protocol of a record or service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// IPv4 and IPv6
    #[default]
    Unspec,
    Inet,
    Inet6,
}

impl Protocol {
    /// Wire value.
    pub fn to_raw(self) -> i32 {
        match self {
            Protocol::Unspec => -1,
            Protocol::Inet => 0,
            Protocol::Inet6 => 1,
        }
    }
}

impl TryFrom<i32> for Protocol {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Protocol::Unspec),
            0 => Ok(Protocol::Inet),
            1 => Ok(Protocol::Inet6),
            other => Err(format!("unknown protocol {}", other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Unspec => write!(f, "any"),
            Protocol::Inet => write!(f, "IPv4"),
            Protocol::Inet6 => write!(f, "IPv6"),
        }
    }
}

/// Avahi daemon state.
///
/// Only [`ServerState::Running`] means services can be published and
/// resolved reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Invalid,
    /// Host RRs are being registered
    Registering,
    /// All host RRs have been established
    Running,
    /// A host name collision was detected
    Collision,
    /// Fatal failure of the daemon
    Failure,
}

impl ServerState {
    pub fn is_running(self) -> bool {
        self == ServerState::Running
    }
}

impl TryFrom<i32> for ServerState {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ServerState::Invalid),
            1 => Ok(ServerState::Registering),
            2 => Ok(ServerState::Running),
            3 => Ok(ServerState::Collision),
            4 => Ok(ServerState::Failure),
            other => Err(format!("unknown server state {}", other)),
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Invalid => "invalid",
            ServerState::Registering => "registering",
            ServerState::Running => "running",
            ServerState::Collision => "collision",
            ServerState::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// State of an entry group, as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryGroupState {
    /// Not yet committed (or reset)
    #[default]
    Uncommitted,
    Registering,
    /// Successfully published
    Established,
    /// A name collision was detected; pick a new name
    Collision,
    Failure,
}

impl TryFrom<i32> for EntryGroupState {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EntryGroupState::Uncommitted),
            1 => Ok(EntryGroupState::Registering),
            2 => Ok(EntryGroupState::Established),
            3 => Ok(EntryGroupState::Collision),
            4 => Ok(EntryGroupState::Failure),
            other => Err(format!("unknown entry group state {}", other)),
        }
    }
}

impl fmt::Display for EntryGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryGroupState::Uncommitted => "uncommitted",
            EntryGroupState::Registering => "registering",
            EntryGroupState::Established => "established",
            EntryGroupState::Collision => "collision",
            EntryGroupState::Failure => "failure",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    /// Flags for browsers and resolvers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct LookupFlags: u32 {
        /// Force lookup via wide area DNS
        const USE_WIDE_AREA = 1;
        /// Force lookup via multicast DNS
        const USE_MULTICAST = 2;
        /// Don't look up the TXT record when resolving
        const NO_TXT = 4;
        /// Don't look up the address when resolving
        const NO_ADDRESS = 8;
    }
}

bitflags::bitflags! {
    /// Flags attached to every browse/resolve result.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct LookupResultFlags: u32 {
        /// Served from the daemon's cache
        const CACHED = 1;
        const WIDE_AREA = 2;
        const MULTICAST = 4;
        /// Originates from this host
        const LOCAL = 8;
        /// Registered by this client
        const OUR_OWN = 16;
        /// Comes from a static service definition
        const STATIC = 32;
    }
}

bitflags::bitflags! {
    /// Flags for publishing entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct PublishFlags: u32 {
        const UNIQUE = 1;
        const NO_PROBE = 2;
        const NO_ANNOUNCE = 4;
        const ALLOW_MULTIPLE = 8;
        const NO_REVERSE = 16;
        const NO_COOKIE = 32;
        const UPDATE = 64;
        const USE_WIDE_AREA = 128;
        const USE_MULTICAST = 256;
    }
}

/// Global daemon state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStateChange {
    pub state: ServerState,
    /// Error text reported by the daemon, usually empty
    pub error: String,
}

/// Entry group state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryGroupStateChange {
    pub state: EntryGroupState,
    pub error: String,
}

/// A DNS record reported by a record browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordItem {
    pub interface: Interface,
    pub protocol: Protocol,
    pub name: String,
    pub class: RecordClass,
    pub record_type: RecordType,
    pub rdata: RecordData,
    pub flags: LookupResultFlags,
}

/// Wire shape of record browser items.
pub(crate) type RecordItemArgs = (i32, i32, String, u16, u16, Vec<u8>, u32);

impl TryFrom<RecordItemArgs> for RecordItem {
    type Error = String;

    fn try_from(args: RecordItemArgs) -> Result<Self, Self::Error> {
        let (interface, protocol, name, class, record_type, rdata, flags) = args;
        Ok(Self {
            interface,
            protocol: Protocol::try_from(protocol)?,
            name,
            class,
            record_type,
            rdata,
            flags: LookupResultFlags::from_bits_retain(flags),
        })
    }
}

/// A service reported by a service browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceItem {
    pub interface: Interface,
    pub protocol: Protocol,
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub flags: LookupResultFlags,
}

pub(crate) type ServiceItemArgs = (i32, i32, String, String, String, u32);

impl TryFrom<ServiceItemArgs> for ServiceItem {
    type Error = String;

    fn try_from(args: ServiceItemArgs) -> Result<Self, Self::Error> {
        let (interface, protocol, name, service_type, domain, flags) = args;
        Ok(Self {
            interface,
            protocol: Protocol::try_from(protocol)?,
            name,
            service_type,
            domain,
            flags: LookupResultFlags::from_bits_retain(flags),
        })
    }
}

/// Result of a service resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedService {
    pub interface: Interface,
    pub protocol: Protocol,
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub host: String,
    /// Address family of `address`
    pub aprotocol: Protocol,
    /// Address in its usual textual notation
    pub address: String,
    pub port: Port,
    #[serde(serialize_with = "serialize_txt")]
    pub txt: Txt,
    pub flags: LookupResultFlags,
}

pub(crate) type ResolvedServiceArgs = (
    i32,
    i32,
    String,
    String,
    String,
    String,
    i32,
    String,
    u16,
    Vec<Vec<u8>>,
    u32,
);

impl TryFrom<ResolvedServiceArgs> for ResolvedService {
    type Error = String;

    fn try_from(args: ResolvedServiceArgs) -> Result<Self, Self::Error> {
        let (
            interface,
            protocol,
            name,
            service_type,
            domain,
            host,
            aprotocol,
            address,
            port,
            txt,
            flags,
        ) = args;
        Ok(Self {
            interface,
            protocol: Protocol::try_from(protocol)?,
            name,
            service_type,
            domain,
            host,
            aprotocol: Protocol::try_from(aprotocol)?,
            address,
            port,
            txt,
            flags: LookupResultFlags::from_bits_retain(flags),
        })
    }
}

impl ResolvedService {
    /// Parsed address, if the daemon reported a valid one.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        // Link-local IPv6 addresses may carry a "%scope" suffix
        let address = self.address.split('%').next().unwrap_or_default();
        address.parse().ok()
    }

    /// TXT entries as `key=value` strings (lossy UTF-8).
    pub fn txt_strings(&self) -> Vec<String> {
        self.txt
            .iter()
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            .collect()
    }
}

fn serialize_txt<S>(txt: &Txt, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeSeq;

    let mut seq = serializer.serialize_seq(Some(txt.len()))?;
    for entry in txt {
        seq.serialize_element(&String::from_utf8_lossy(entry))?;
    }
    seq.end()
}

/// Build a TXT entry from a key and value.
pub fn txt_entry(key: &str, value: &str) -> Vec<u8> {
    format!("{}={}", key, value).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_wire_values() {
        assert_eq!(Protocol::try_from(-1), Ok(Protocol::Unspec));
        assert_eq!(Protocol::try_from(0), Ok(Protocol::Inet));
        assert_eq!(Protocol::try_from(1), Ok(Protocol::Inet6));
        assert!(Protocol::try_from(7).is_err());
        assert_eq!(Protocol::Inet6.to_raw(), 1);
    }

    #[test]
    fn test_server_state_conversion() {
        assert_eq!(ServerState::try_from(2), Ok(ServerState::Running));
        assert!(ServerState::try_from(2).unwrap().is_running());
        assert!(!ServerState::Registering.is_running());
        assert!(ServerState::try_from(9).is_err());
    }

    #[test]
    fn test_entry_group_state_conversion() {
        assert_eq!(EntryGroupState::try_from(0), Ok(EntryGroupState::Uncommitted));
        assert_eq!(EntryGroupState::try_from(2), Ok(EntryGroupState::Established));
        assert_eq!(EntryGroupState::try_from(3), Ok(EntryGroupState::Collision));
        assert!(EntryGroupState::try_from(-1).is_err());
    }

    #[test]
    fn test_flags_operations() {
        let flags = LookupResultFlags::CACHED | LookupResultFlags::MULTICAST;
        assert_eq!(flags.bits(), 5);
        assert!(flags.contains(LookupResultFlags::CACHED));
        assert!(!flags.contains(LookupResultFlags::LOCAL));
        assert!(LookupFlags::empty().is_empty());

        let mut publish = PublishFlags::empty();
        publish |= PublishFlags::UPDATE;
        assert_eq!(publish, PublishFlags::from_bits_retain(64));
    }

    #[test]
    fn test_result_flags_keep_unknown_bits() {
        let flags = LookupResultFlags::from_bits_retain(0x41);
        assert!(flags.contains(LookupResultFlags::CACHED));
        assert_eq!(flags.bits(), 0x41);
    }

    #[test]
    fn test_flags_serialize_as_names() {
        let flags = LookupResultFlags::CACHED | LookupResultFlags::LOCAL;
        let json = serde_json::to_string(&flags).unwrap();
        assert_eq!(json, "\"CACHED | LOCAL\"");
    }

    #[test]
    fn test_dns_type_parse() {
        assert_eq!(dns_type::parse("ptr"), Some(dns_type::PTR));
        assert_eq!(dns_type::parse("SRV"), Some(dns_type::SRV));
        assert_eq!(dns_type::parse("28"), Some(dns_type::AAAA));
        assert_eq!(dns_type::parse("bogus"), None);
    }

    #[test]
    fn test_service_item_from_args() {
        let item = ServiceItem::try_from((
            1,
            0,
            "printer".to_string(),
            "_http._tcp".to_string(),
            "local".to_string(),
            0,
        ))
        .unwrap();
        assert_eq!(item.protocol, Protocol::Inet);
        assert_eq!(item.name, "printer");
        assert!(item.flags.is_empty());
    }

    #[test]
    fn test_record_item_rejects_unknown_protocol() {
        let result = RecordItem::try_from((
            1,
            5,
            "host.local".to_string(),
            dns_class::IN,
            dns_type::A,
            vec![192, 168, 0, 1],
            0,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolved_service_helpers() {
        let resolved = ResolvedService {
            interface: 2,
            protocol: Protocol::Inet6,
            name: "printer".into(),
            service_type: "_ipp._tcp".into(),
            domain: "local".into(),
            host: "printer.local".into(),
            aprotocol: Protocol::Inet6,
            address: "fe80::1%eth0".into(),
            port: 631,
            txt: vec![txt_entry("rp", "ipp/print"), b"duplex".to_vec()],
            flags: LookupResultFlags::empty(),
        };
        assert_eq!(resolved.ip_addr(), Some("fe80::1".parse().unwrap()));
        assert_eq!(resolved.txt_strings(), vec!["rp=ipp/print", "duplex"]);
    }
}
