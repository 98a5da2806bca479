//! RFC 1035 binary parsing and emission, with EDNS(0).
//!
//! We are an authoritative server for a tiny zone, so the codec covers
//! what such a server sees: queries with one question (plus an optional
//! OPT record), and responses carrying A/AAAA/TXT/SOA/NS/CAA answers
//! with simple name compression back to the question name.

use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("packet truncated at byte {0}")]
    Truncated(usize),

    #[error("bad name: {0}")]
    BadName(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Query/record types we speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qtype {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Opt,
    Caa,
    Other(u16),
}

impl Qtype {
    pub fn from_u16(v: u16) -> Qtype {
        match v {
            1 => Qtype::A,
            2 => Qtype::Ns,
            5 => Qtype::Cname,
            6 => Qtype::Soa,
            12 => Qtype::Ptr,
            15 => Qtype::Mx,
            16 => Qtype::Txt,
            28 => Qtype::Aaaa,
            41 => Qtype::Opt,
            257 => Qtype::Caa,
            other => Qtype::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Qtype::A => 1,
            Qtype::Ns => 2,
            Qtype::Cname => 5,
            Qtype::Soa => 6,
            Qtype::Ptr => 12,
            Qtype::Mx => 15,
            Qtype::Txt => 16,
            Qtype::Aaaa => 28,
            Qtype::Opt => 41,
            Qtype::Caa => 257,
            Qtype::Other(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qclass {
    In,
    Any,
    Other(u16),
}

impl Qclass {
    pub fn from_u16(v: u16) -> Qclass {
        match v {
            1 => Qclass::In,
            255 => Qclass::Any,
            other => Qclass::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Qclass::In => 1,
            Qclass::Any => 255,
            Qclass::Other(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
}

impl Rcode {
    pub fn to_u8(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Lowercased labels, root excluded.
    pub labels: Vec<String>,
    pub qtype: Qtype,
    pub qclass: Qclass,
}

impl Question {
    pub fn name(&self) -> String {
        self.labels.join(".")
    }
}

/// EDNS(0) parameters from an OPT record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edns {
    pub udp_size: u16,
    pub version: u8,
    pub do_bit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub questions: Vec<Question>,
    pub edns: Option<Edns>,
}

const MAX_LABELS: usize = 64;
const MAX_POINTER_HOPS: usize = 8;

/// Parse a query packet.
pub fn parse(buf: &[u8]) -> Result<Packet, DnsError> {
    let mut cur = Cursor { buf, pos: 0 };
    let header = parse_header(&mut cur)?;
    let mut questions = Vec::new();
    for _ in 0..header.qdcount {
        questions.push(parse_question(&mut cur)?);
    }
    // skip answer/authority records if any (queries should have none)
    for _ in 0..(header.ancount as usize + header.nscount as usize) {
        skip_record(&mut cur)?;
    }
    let mut edns = None;
    for _ in 0..header.arcount {
        if let Some(e) = parse_additional(&mut cur)? {
            edns = Some(e);
        }
    }
    Ok(Packet { header, questions, edns })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DnsError> {
        let v = *self.buf.get(self.pos).ok_or(DnsError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        Ok(u32::from_be_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }

    fn skip(&mut self, n: usize) -> Result<(), DnsError> {
        if self.pos + n > self.buf.len() {
            return Err(DnsError::Truncated(self.buf.len()));
        }
        self.pos += n;
        Ok(())
    }
}

fn parse_header(cur: &mut Cursor<'_>) -> Result<Header, DnsError> {
    let id = cur.u16()?;
    let flags = cur.u16()?;
    Ok(Header {
        id,
        qr: flags & 0x8000 != 0,
        opcode: ((flags >> 11) & 0xf) as u8,
        aa: flags & 0x0400 != 0,
        tc: flags & 0x0200 != 0,
        rd: flags & 0x0100 != 0,
        ra: flags & 0x0080 != 0,
        rcode: (flags & 0xf) as u8,
        qdcount: cur.u16()?,
        ancount: cur.u16()?,
        nscount: cur.u16()?,
        arcount: cur.u16()?,
    })
}

/// Read a (possibly compressed) name.
fn parse_name(cur: &mut Cursor<'_>) -> Result<Vec<String>, DnsError> {
    let mut labels = Vec::new();
    let mut pos = cur.pos;
    let mut jumped = false;
    let mut hops = 0;
    loop {
        let len = *cur.buf.get(pos).ok_or(DnsError::Truncated(pos))? as usize;
        if len & 0xc0 == 0xc0 {
            // compression pointer
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DnsError::BadName("pointer loop".into()));
            }
            let lo = *cur.buf.get(pos + 1).ok_or(DnsError::Truncated(pos + 1))? as usize;
            if !jumped {
                cur.pos = pos + 2;
                jumped = true;
            }
            pos = ((len & 0x3f) << 8) | lo;
            continue;
        }
        if len & 0xc0 != 0 {
            return Err(DnsError::BadName(format!("bad label length {len:#x}")));
        }
        if len == 0 {
            if !jumped {
                cur.pos = pos + 1;
            }
            return Ok(labels);
        }
        if labels.len() >= MAX_LABELS {
            return Err(DnsError::BadName("too many labels".into()));
        }
        let start = pos + 1;
        let end = start + len;
        let bytes = cur
            .buf
            .get(start..end)
            .ok_or(DnsError::Truncated(cur.buf.len()))?;
        labels.push(String::from_utf8_lossy(bytes).to_ascii_lowercase());
        pos = end;
    }
}

fn parse_question(cur: &mut Cursor<'_>) -> Result<Question, DnsError> {
    let labels = parse_name(cur)?;
    let qtype = Qtype::from_u16(cur.u16()?);
    let qclass = Qclass::from_u16(cur.u16()?);
    Ok(Question { labels, qtype, qclass })
}

fn skip_record(cur: &mut Cursor<'_>) -> Result<(), DnsError> {
    parse_name(cur)?;
    cur.skip(8)?; // type, class, ttl
    let rdlen = cur.u16()? as usize;
    cur.skip(rdlen)
}

/// Parse one additional record; an OPT yields the EDNS parameters.
fn parse_additional(cur: &mut Cursor<'_>) -> Result<Option<Edns>, DnsError> {
    parse_name(cur)?;
    let rtype = Qtype::from_u16(cur.u16()?);
    if rtype != Qtype::Opt {
        cur.skip(6)?; // class, ttl
        let rdlen = cur.u16()? as usize;
        cur.skip(rdlen)?;
        return Ok(None);
    }
    let udp_size = cur.u16()?;
    let ttl = cur.u32()?;
    let rdlen = cur.u16()? as usize;
    cur.skip(rdlen)?;
    Ok(Some(Edns {
        udp_size: udp_size.max(512),
        version: ((ttl >> 16) & 0xff) as u8,
        do_bit: ttl & 0x8000 != 0,
    }))
}

// ---- emission ----

/// The answer payloads we can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRecord {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Txt(Vec<String>),
    Ns(String),
    /// mname, rname, serial, refresh, retry, expire, minimum
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    /// flags, tag, value
    Caa(u8, String, String),
}

impl ResourceRecord {
    fn qtype(&self) -> Qtype {
        match self {
            ResourceRecord::A(_) => Qtype::A,
            ResourceRecord::Aaaa(_) => Qtype::Aaaa,
            ResourceRecord::Txt(_) => Qtype::Txt,
            ResourceRecord::Ns(_) => Qtype::Ns,
            ResourceRecord::Soa { .. } => Qtype::Soa,
            ResourceRecord::Caa(..) => Qtype::Caa,
        }
    }
}

/// Emit a response to `query`, echoing its question, answering with
/// `answers` (owner = the question name, compressed), EDNS echoed when
/// the query carried it.  `udp_size` caps the packet: overflow sets TC
/// and truncates at a record boundary.
pub fn write_response(
    query: &Packet,
    rcode: Rcode,
    answers: &[ResourceRecord],
    authority: &[ResourceRecord],
) -> Result<Vec<u8>, DnsError> {
    let size_limit = query.edns.map(|e| e.udp_size as usize).unwrap_or(512);
    let mut out = Vec::with_capacity(256);

    // header, counts patched at the end
    out.extend_from_slice(&query.header.id.to_be_bytes());
    let mut flags: u16 = 0x8000 | 0x0400; // QR + AA
    flags |= (query.header.opcode as u16) << 11;
    if query.header.rd {
        flags |= 0x0100;
    }
    flags |= rcode.to_u8() as u16;
    out.extend_from_slice(&flags.to_be_bytes());
    let qdcount = query.questions.len().min(1) as u16;
    out.extend_from_slice(&qdcount.to_be_bytes());
    out.extend_from_slice(&[0u8; 6]); // an/ns/ar counts

    // echo the first question
    let mut qname_off = None;
    if let Some(q) = query.questions.first() {
        qname_off = Some(out.len() as u16);
        write_name(&mut out, &q.labels);
        out.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
        out.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
    }

    let mut ancount: u16 = 0;
    let mut nscount: u16 = 0;
    let mut truncated = false;

    for (section, records) in [(0usize, answers), (1, authority)] {
        for rr in records {
            let mark = out.len();
            write_record(&mut out, qname_off, rr);
            if out.len() > size_limit.saturating_sub(query.edns.map(|_| 11).unwrap_or(0)) {
                out.truncate(mark);
                truncated = true;
                break;
            }
            if section == 0 {
                ancount += 1;
            } else {
                nscount += 1;
            }
        }
    }

    let mut arcount: u16 = 0;
    if let Some(edns) = query.edns {
        // root name, OPT, our udp size, zero ext-rcode/version/flags
        out.push(0);
        out.extend_from_slice(&Qtype::Opt.to_u16().to_be_bytes());
        out.extend_from_slice(&1232u16.to_be_bytes());
        let ttl: u32 = if edns.do_bit { 0x8000 } else { 0 };
        out.extend_from_slice(&ttl.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        arcount = 1;
    }

    if truncated {
        out[2] |= 0x02; // TC
    }
    out[6..8].copy_from_slice(&ancount.to_be_bytes());
    out[8..10].copy_from_slice(&nscount.to_be_bytes());
    out[10..12].copy_from_slice(&arcount.to_be_bytes());
    Ok(out)
}

fn write_name(out: &mut Vec<u8>, labels: &[String]) {
    for label in labels {
        let bytes = label.as_bytes();
        out.push(bytes.len().min(63) as u8);
        out.extend_from_slice(&bytes[..bytes.len().min(63)]);
    }
    out.push(0);
}

fn write_name_str(out: &mut Vec<u8>, name: &str) {
    let labels: Vec<String> = name
        .split('.')
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect();
    write_name(out, &labels);
}

fn write_record(out: &mut Vec<u8>, qname_off: Option<u16>, rr: &ResourceRecord) {
    // owner: compression pointer to the question name when possible
    match qname_off {
        Some(off) => out.extend_from_slice(&(0xc000u16 | off).to_be_bytes()),
        None => out.push(0),
    }
    out.extend_from_slice(&rr.qtype().to_u16().to_be_bytes());
    out.extend_from_slice(&Qclass::In.to_u16().to_be_bytes());
    let ttl: u32 = match rr {
        ResourceRecord::Txt(_) => 0,
        _ => 300,
    };
    out.extend_from_slice(&ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match rr {
        ResourceRecord::A(ip) => rdata.extend_from_slice(&ip.octets()),
        ResourceRecord::Aaaa(ip) => rdata.extend_from_slice(&ip.octets()),
        ResourceRecord::Txt(strings) => {
            for s in strings {
                let bytes = s.as_bytes();
                rdata.push(bytes.len().min(255) as u8);
                rdata.extend_from_slice(&bytes[..bytes.len().min(255)]);
            }
        }
        ResourceRecord::Ns(name) => write_name_str(&mut rdata, name),
        ResourceRecord::Soa { mname, rname, serial, refresh, retry, expire, minimum } => {
            write_name_str(&mut rdata, mname);
            write_name_str(&mut rdata, rname);
            for v in [serial, refresh, retry, expire, minimum] {
                rdata.extend_from_slice(&v.to_be_bytes());
            }
        }
        ResourceRecord::Caa(flags, tag, value) => {
            rdata.push(*flags);
            rdata.push(tag.len().min(255) as u8);
            rdata.extend_from_slice(&tag.as_bytes()[..tag.len().min(255)]);
            rdata.extend_from_slice(value.as_bytes());
        }
    }
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A hand-built query for `acme.user.example.com TXT` with EDNS.
    fn sample_query() -> Vec<u8> {
        let mut q = Vec::new();
        q.extend_from_slice(&0x1234u16.to_be_bytes()); // id
        q.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
        q.extend_from_slice(&1u16.to_be_bytes()); // qd
        q.extend_from_slice(&0u16.to_be_bytes());
        q.extend_from_slice(&0u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes()); // ar (OPT)
        for label in ["acme", "user", "example", "com"] {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&16u16.to_be_bytes()); // TXT
        q.extend_from_slice(&1u16.to_be_bytes()); // IN
        // OPT
        q.push(0);
        q.extend_from_slice(&41u16.to_be_bytes());
        q.extend_from_slice(&1232u16.to_be_bytes());
        q.extend_from_slice(&0u32.to_be_bytes());
        q.extend_from_slice(&0u16.to_be_bytes());
        q
    }

    #[test]
    fn parses_query_with_edns() {
        let pkt = parse(&sample_query()).unwrap();
        assert_eq!(pkt.header.id, 0x1234);
        assert!(!pkt.header.qr);
        assert!(pkt.header.rd);
        assert_eq!(pkt.questions.len(), 1);
        let q = &pkt.questions[0];
        assert_eq!(q.name(), "acme.user.example.com");
        assert_eq!(q.qtype, Qtype::Txt);
        assert_eq!(q.qclass, Qclass::In);
        let edns = pkt.edns.unwrap();
        assert_eq!(edns.udp_size, 1232);
        assert!(!edns.do_bit);
    }

    #[test]
    fn truncated_packets_fail() {
        let q = sample_query();
        for cut in [1, 5, 12, 20] {
            assert!(parse(&q[..cut]).is_err(), "cut={cut}");
        }
    }

    #[test]
    fn name_compression_is_followed() {
        // header + question "a.b" + second question pointing at offset 12
        let mut q = Vec::new();
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&0u16.to_be_bytes());
        q.extend_from_slice(&2u16.to_be_bytes()); // 2 questions
        q.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        q.extend_from_slice(&[1, b'a', 1, b'b', 0]);
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&[0xc0, 12]); // pointer to first name
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes());
        let pkt = parse(&q).unwrap();
        assert_eq!(pkt.questions[1].name(), "a.b");
    }

    #[test]
    fn pointer_loops_are_rejected() {
        let mut q = Vec::new();
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&0u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        q.extend_from_slice(&[0xc0, 12]); // points at itself
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes());
        assert!(parse(&q).is_err());
    }

    #[test]
    fn response_roundtrips_through_parse() {
        let query = parse(&sample_query()).unwrap();
        let resp = write_response(
            &query,
            Rcode::NoError,
            &[ResourceRecord::Txt(vec!["challenge-token".into()])],
            &[],
        )
        .unwrap();
        let parsed = parse(&resp).unwrap();
        assert_eq!(parsed.header.id, 0x1234);
        assert!(parsed.header.qr);
        assert!(parsed.header.aa);
        assert_eq!(parsed.header.ancount, 1);
        assert_eq!(parsed.questions[0].name(), "acme.user.example.com");
        assert!(parsed.edns.is_some());
    }

    #[test]
    fn nxdomain_with_soa_authority() {
        let query = parse(&sample_query()).unwrap();
        let resp = write_response(
            &query,
            Rcode::NxDomain,
            &[],
            &[ResourceRecord::Soa {
                mname: "ns1.example.com".into(),
                rname: "admin.example.com".into(),
                serial: 1,
                refresh: 3600,
                retry: 600,
                expire: 86400,
                minimum: 60,
            }],
        )
        .unwrap();
        let parsed = parse(&resp).unwrap();
        assert_eq!(parsed.header.rcode, Rcode::NxDomain.to_u8());
        assert_eq!(parsed.header.nscount, 1);
    }
}
