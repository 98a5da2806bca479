//! Authoritative-DNS plumbing: the binary packet codec and the
//! per-source response rate limiter.

pub mod packet;
pub mod rrl;

pub use packet::{DnsError, Header, Packet, Qclass, Qtype, Question, Rcode, ResourceRecord};
pub use rrl::Rrl;
