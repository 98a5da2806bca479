//! The SPLINTERMAIL MESSAGE envelope.
//!
//! ```text
//! -----BEGIN SPLINTERMAIL MESSAGE-----
//! <base64 of:
//!   V:1\n
//!   R:<hlen>:<hash octets>:<klen>:<rsa-encrypted key octets>\n   (per recipient)
//!   IV:12:<iv octets>\n
//!   M:<aes-256-gcm ciphertext until end of base64>
//! >
//! =<base64 of the 16-byte GCM tag>
//! -----END SPLINTERMAIL MESSAGE-----
//! ```
//!
//! The numbers inside the base64 are ascii; the octets are raw, so the
//! body is length-delimited, not line-delimited.  Version 1 means
//! SHA-256 fingerprints and AES-256-GCM.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use rsa::Pkcs1v15Encrypt;

use crate::error::CryptoError;
use crate::keypair::{Fingerprint, Keypair, PublicKey};

pub const VERSION: u32 = 1;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const MAX_RECIPIENTS: usize = 128;
/// Width of the base64 body lines.
const B64_LINE: usize = 64;

const PEM_HEADER: &str = "-----BEGIN SPLINTERMAIL MESSAGE-----";
const PEM_FOOTER: &str = "-----END SPLINTERMAIL MESSAGE-----";

// ---- encrypter ----

/// Multi-recipient streaming encrypter.
///
/// `update` accepts plaintext as it arrives; the AES-GCM pass runs at
/// `finish`, which is also the earliest the GCM tag can exist.  The
/// header is emitted eagerly so the output stays one-pass on the wire.
pub struct Encrypter {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    plaintext: Vec<u8>,
    /// raw (pre-base64) bytes not yet flushed as full 3-byte groups
    pre64: Vec<u8>,
    /// base64 chars not yet emitted as a full line
    line: String,
}

impl Encrypter {
    /// Start an envelope to `recipients`; returns the encrypter and the
    /// header bytes.
    pub fn new(recipients: &[Arc<PublicKey>]) -> Result<(Encrypter, Vec<u8>), CryptoError> {
        if recipients.is_empty() {
            return Err(CryptoError::Param("no recipients".into()));
        }
        if recipients.len() > MAX_RECIPIENTS {
            return Err(CryptoError::Param(format!(
                "{} recipients exceeds the {MAX_RECIPIENTS} limit",
                recipients.len()
            )));
        }

        let mut rng = rand::thread_rng();
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        let mut enc = Encrypter {
            key,
            iv,
            plaintext: Vec::new(),
            pre64: Vec::new(),
            line: String::new(),
        };

        let mut out = Vec::new();
        out.extend_from_slice(PEM_HEADER.as_bytes());
        out.push(b'\n');

        let mut header = Vec::new();
        header.extend_from_slice(format!("V:{VERSION}\n").as_bytes());
        for pk in recipients {
            let enc_key = pk
                .rsa()
                .encrypt(&mut rng, Pkcs1v15Encrypt, &enc.key)
                .map_err(CryptoError::Key)?;
            let hash = pk.fingerprint().as_bytes();
            header.extend_from_slice(format!("R:{}:", hash.len()).as_bytes());
            header.extend_from_slice(hash);
            header.extend_from_slice(format!(":{}:", enc_key.len()).as_bytes());
            header.extend_from_slice(&enc_key);
            header.push(b'\n');
        }
        header.extend_from_slice(format!("IV:{IV_LEN}:").as_bytes());
        header.extend_from_slice(&enc.iv);
        header.push(b'\n');
        header.extend_from_slice(b"M:");

        enc.push_b64(&header, &mut out);
        Ok((enc, out))
    }

    /// Feed plaintext.
    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.plaintext.extend_from_slice(input);
        Vec::new()
    }

    /// Run the cipher, emit the remaining body, the tag line and the
    /// footer.
    pub fn finish(mut self) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let nonce = Nonce::from_slice(&self.iv);
        let mut sealed = cipher
            .encrypt(nonce, Payload { msg: &self.plaintext, aad: b"" })
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        let ciphertext = sealed;

        let mut out = Vec::new();
        self.push_b64(&ciphertext, &mut out);
        self.flush_b64(&mut out);

        out.push(b'=');
        out.extend_from_slice(B64.encode(&tag).as_bytes());
        out.push(b'\n');
        out.extend_from_slice(PEM_FOOTER.as_bytes());
        out.push(b'\n');
        Ok(out)
    }

    /// base64 the raw bytes, emitting complete 64-char lines.
    fn push_b64(&mut self, raw: &[u8], out: &mut Vec<u8>) {
        self.pre64.extend_from_slice(raw);
        let whole = self.pre64.len() / 3 * 3;
        let chunk: Vec<u8> = self.pre64.drain(..whole).collect();
        self.line.push_str(&B64.encode(chunk));
        while self.line.len() >= B64_LINE {
            let rest = self.line.split_off(B64_LINE);
            out.extend_from_slice(self.line.as_bytes());
            out.push(b'\n');
            self.line = rest;
        }
    }

    /// Emit the trailing partial group and line.
    fn flush_b64(&mut self, out: &mut Vec<u8>) {
        if !self.pre64.is_empty() {
            let chunk: Vec<u8> = self.pre64.drain(..).collect();
            self.line.push_str(&B64.encode(chunk));
        }
        while self.line.len() >= B64_LINE {
            let rest = self.line.split_off(B64_LINE);
            out.extend_from_slice(self.line.as_bytes());
            out.push(b'\n');
            self.line = rest;
        }
        if !self.line.is_empty() {
            out.extend_from_slice(self.line.as_bytes());
            out.push(b'\n');
            self.line.clear();
        }
    }
}

/// Does this look like one of our envelopes?  (Exact header match;
/// mail that merely mentions PEM armor does not qualify.)
pub fn is_envelope(bytes: &[u8]) -> bool {
    bytes.starts_with(PEM_HEADER.as_bytes())
}

/// Convenience one-shot encryption.
pub fn encrypt(recipients: &[Arc<PublicKey>], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (mut enc, mut out) = Encrypter::new(recipients)?;
    let _ = enc.update(plaintext);
    out.extend_from_slice(&enc.finish()?);
    Ok(out)
}

// ---- decrypter ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecState {
    /// Before the BEGIN line.
    Preamble,
    /// Inside the base64 body.
    Body,
    /// Tag line seen, awaiting footer.
    Footer,
    Done,
}

/// Streaming decrypter.
///
/// Plaintext is never released before the GCM tag verifies: the
/// ciphertext accumulates internally and [`Decrypter::finish`] returns
/// the whole message or an error.
pub struct Decrypter<'a> {
    kp: &'a Keypair,
    state: DecState,
    /// carry of an incomplete input line
    line_carry: Vec<u8>,
    /// carry of base64 chars not yet forming a 4-group
    b64_carry: String,
    /// decoded header bytes not yet parsed
    buffer: Vec<u8>,
    header_done: bool,
    version: Option<u32>,
    /// all fingerprints seen in R entries, for observers
    pub recipients: Vec<Fingerprint>,
    /// the RSA-encrypted symmetric key matching our fingerprint
    enc_key: Option<Vec<u8>>,
    iv: Option<Vec<u8>>,
    ciphertext: Vec<u8>,
    tag: Option<Vec<u8>>,
}

impl<'a> Decrypter<'a> {
    pub fn new(kp: &'a Keypair) -> Decrypter<'a> {
        Decrypter {
            kp,
            state: DecState::Preamble,
            line_carry: Vec::new(),
            b64_carry: String::new(),
            buffer: Vec::new(),
            header_done: false,
            version: None,
            recipients: Vec::new(),
            enc_key: None,
            iv: None,
            ciphertext: Vec::new(),
            tag: None,
        }
    }

    /// Feed envelope bytes as they arrive.
    pub fn update(&mut self, input: &[u8]) -> Result<(), CryptoError> {
        self.line_carry.extend_from_slice(input);
        while let Some(pos) = self.line_carry.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_carry.drain(..pos + 1).collect();
            let line = &line[..line.len() - 1];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            self.take_line(line)?;
        }
        Ok(())
    }

    fn take_line(&mut self, line: &[u8]) -> Result<(), CryptoError> {
        match self.state {
            DecState::Preamble => {
                if line == PEM_HEADER.as_bytes() {
                    self.state = DecState::Body;
                }
                // anything before BEGIN is ignorable armor
            }
            DecState::Body => {
                if let Some(tag64) = line.strip_prefix(b"=") {
                    self.decode_b64_tail()?;
                    let tag = B64
                        .decode(tag64)
                        .map_err(|e| CryptoError::Envelope(format!("bad tag base64: {e}")))?;
                    if tag.len() != TAG_LEN {
                        return Err(CryptoError::Envelope(format!(
                            "tag is {} bytes, expected {TAG_LEN}",
                            tag.len()
                        )));
                    }
                    self.tag = Some(tag);
                    self.state = DecState::Footer;
                } else if line.starts_with(b"-") {
                    return Err(CryptoError::Envelope("footer before tag".into()));
                } else {
                    for &b in line {
                        if !b.is_ascii_whitespace() {
                            self.b64_carry.push(b as char);
                        }
                    }
                    self.decode_b64_groups()?;
                }
            }
            DecState::Footer => {
                if line == PEM_FOOTER.as_bytes() {
                    self.state = DecState::Done;
                } else if !line.is_empty() {
                    return Err(CryptoError::Envelope("garbage between tag and footer".into()));
                }
            }
            DecState::Done => {}
        }
        Ok(())
    }

    fn decode_b64_groups(&mut self) -> Result<(), CryptoError> {
        let whole = self.b64_carry.len() / 4 * 4;
        if whole == 0 {
            return Ok(());
        }
        let chunk: String = self.b64_carry.drain(..whole).collect();
        let raw = B64
            .decode(chunk.as_bytes())
            .map_err(|e| CryptoError::Envelope(format!("bad body base64: {e}")))?;
        self.absorb(&raw)
    }

    fn decode_b64_tail(&mut self) -> Result<(), CryptoError> {
        self.decode_b64_groups()?;
        if !self.b64_carry.is_empty() {
            let chunk: String = self.b64_carry.drain(..).collect();
            let raw = B64
                .decode(chunk.as_bytes())
                .map_err(|e| CryptoError::Envelope(format!("bad body base64: {e}")))?;
            self.absorb(&raw)?;
        }
        Ok(())
    }

    /// Route decoded bytes: header fields first, then raw ciphertext.
    fn absorb(&mut self, raw: &[u8]) -> Result<(), CryptoError> {
        if self.header_done {
            self.ciphertext.extend_from_slice(raw);
            return Ok(());
        }
        self.buffer.extend_from_slice(raw);
        loop {
            match parse_header_field(&self.buffer)? {
                Parsed::NeedMore => return Ok(()),
                Parsed::Version(v, used) => {
                    if v != VERSION {
                        return Err(CryptoError::Envelope(format!("unsupported version {v}")));
                    }
                    self.version = Some(v);
                    self.buffer.drain(..used);
                }
                Parsed::Recipient { hash, key, used } => {
                    if let Ok(fpr) = Fingerprint::from_slice(&hash) {
                        if &fpr == self.kp.fingerprint() {
                            self.enc_key = Some(key);
                        }
                        self.recipients.push(fpr);
                    }
                    self.buffer.drain(..used);
                }
                Parsed::Iv(iv, used) => {
                    if iv.len() != IV_LEN {
                        return Err(CryptoError::Envelope(format!(
                            "IV is {} bytes, expected {IV_LEN}",
                            iv.len()
                        )));
                    }
                    self.iv = Some(iv);
                    self.buffer.drain(..used);
                }
                Parsed::MessageStart(used) => {
                    self.buffer.drain(..used);
                    self.header_done = true;
                    let rest = std::mem::take(&mut self.buffer);
                    self.ciphertext.extend_from_slice(&rest);
                    return Ok(());
                }
            }
        }
    }

    /// Verify and decrypt; plaintext is only ever produced here.
    pub fn finish(mut self) -> Result<Vec<u8>, CryptoError> {
        if self.state != DecState::Done {
            // tolerate a missing trailing newline after the footer
            if !self.line_carry.is_empty() {
                let line = std::mem::take(&mut self.line_carry);
                self.take_line(&line)?;
            }
        }
        if self.state != DecState::Done {
            return Err(CryptoError::Envelope("truncated envelope".into()));
        }
        if self.version.is_none() || self.iv.is_none() || !self.header_done {
            return Err(CryptoError::Envelope("incomplete header".into()));
        }
        let tag = self
            .tag
            .ok_or_else(|| CryptoError::Envelope("missing tag".into()))?;
        let enc_key = self.enc_key.ok_or(CryptoError::NotForMe)?;

        let sym_key = self
            .kp
            .private()
            .decrypt(Pkcs1v15Encrypt, &enc_key)
            .map_err(|_| CryptoError::Decrypt("symmetric key unwrap failed".into()))?;
        if sym_key.len() != KEY_LEN {
            return Err(CryptoError::Decrypt("unwrapped key has wrong size".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&sym_key)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let iv = self.iv.unwrap();
        let nonce = Nonce::from_slice(&iv);
        let mut sealed = self.ciphertext;
        sealed.extend_from_slice(&tag);
        cipher
            .decrypt(nonce, Payload { msg: &sealed, aad: b"" })
            .map_err(|_| CryptoError::Decrypt("authentication failed".into()))
    }
}

/// Convenience one-shot decryption.
pub fn decrypt(kp: &Keypair, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut dec = Decrypter::new(kp);
    dec.update(envelope)?;
    dec.finish()
}

enum Parsed {
    NeedMore,
    Version(u32, usize),
    Recipient { hash: Vec<u8>, key: Vec<u8>, used: usize },
    Iv(Vec<u8>, usize),
    MessageStart(usize),
}

/// Parse one length-delimited header field from the front of `buf`.
fn parse_header_field(buf: &[u8]) -> Result<Parsed, CryptoError> {
    if buf.len() < 2 {
        return Ok(Parsed::NeedMore);
    }
    if buf.starts_with(b"V:") {
        let Some(end) = buf.iter().position(|&b| b == b'\n') else {
            return Ok(Parsed::NeedMore);
        };
        let v = ascii_number(&buf[2..end])?;
        return Ok(Parsed::Version(v as u32, end + 1));
    }
    if buf.starts_with(b"R:") {
        let mut pos = 2;
        let Some(hash) = take_len_block(buf, &mut pos)? else {
            return Ok(Parsed::NeedMore);
        };
        if buf.get(pos) != Some(&b':') {
            return if pos >= buf.len() {
                Ok(Parsed::NeedMore)
            } else {
                Err(CryptoError::Envelope("malformed R entry".into()))
            };
        }
        pos += 1;
        let Some(key) = take_len_block(buf, &mut pos)? else {
            return Ok(Parsed::NeedMore);
        };
        if buf.get(pos) != Some(&b'\n') {
            return if pos >= buf.len() {
                Ok(Parsed::NeedMore)
            } else {
                Err(CryptoError::Envelope("malformed R entry".into()))
            };
        }
        return Ok(Parsed::Recipient { hash, key, used: pos + 1 });
    }
    if buf.starts_with(b"IV:") {
        let mut pos = 3;
        let Some(iv) = take_len_block(buf, &mut pos)? else {
            return Ok(Parsed::NeedMore);
        };
        if buf.get(pos) != Some(&b'\n') {
            return if pos >= buf.len() {
                Ok(Parsed::NeedMore)
            } else {
                Err(CryptoError::Envelope("malformed IV entry".into()))
            };
        }
        return Ok(Parsed::Iv(iv, pos + 1));
    }
    if buf.starts_with(b"M:") {
        return Ok(Parsed::MessageStart(2));
    }
    Err(CryptoError::Envelope(format!(
        "unrecognized header field: {:?}",
        &buf[..buf.len().min(8)]
    )))
}

/// `<ascii-len>:<len raw bytes>` starting at `*pos`; None = need more.
fn take_len_block(buf: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, CryptoError> {
    let Some(colon) = buf[*pos..].iter().position(|&b| b == b':') else {
        // an unreasonable run of digits means a broken envelope
        if buf.len() - *pos > 10 {
            return Err(CryptoError::Envelope("unterminated length".into()));
        }
        return Ok(None);
    };
    let len = ascii_number(&buf[*pos..*pos + colon])?;
    let start = *pos + colon + 1;
    if buf.len() < start + len {
        return Ok(None);
    }
    *pos = start + len;
    Ok(Some(buf[start..start + len].to_vec()))
}

fn ascii_number(digits: &[u8]) -> Result<usize, CryptoError> {
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(CryptoError::Envelope("bad ascii number".into()));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| CryptoError::Envelope("bad ascii number".into()))
}
