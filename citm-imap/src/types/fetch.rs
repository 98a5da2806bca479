use crate::error::ImapError;
use crate::types::core::IString;

/// `section-text` inside a BODY[...] fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionText {
    Header,
    HeaderFields(Vec<IString>),
    HeaderFieldsNot(Vec<IString>),
    Text,
    Mime,
}

/// `section` inside a BODY[...] fetch: a dotted part path plus an
/// optional trailing section-text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Section {
    pub part: Vec<u32>,
    pub text: Option<SectionText>,
}

/// `<origin.count>` partial-fetch suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partial {
    pub offset: u32,
    pub count: u32,
}

/// One fetch attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchAttr {
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    Body,
    BodyStructure,
    BodySection {
        peek: bool,
        section: Section,
        partial: Option<Partial>,
    },
    Uid,
    ModSeq,
}

/// The attribute list or one of the three macros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSpec {
    All,
    Fast,
    Full,
    Attrs(Vec<FetchAttr>),
}

impl FetchSpec {
    /// Expand macros into the equivalent attribute list.
    pub fn expand(&self) -> Vec<FetchAttr> {
        match self {
            FetchSpec::Fast => vec![
                FetchAttr::Flags,
                FetchAttr::InternalDate,
                FetchAttr::Rfc822Size,
            ],
            FetchSpec::All => vec![
                FetchAttr::Flags,
                FetchAttr::InternalDate,
                FetchAttr::Rfc822Size,
                FetchAttr::Envelope,
            ],
            FetchSpec::Full => vec![
                FetchAttr::Flags,
                FetchAttr::InternalDate,
                FetchAttr::Rfc822Size,
                FetchAttr::Envelope,
                FetchAttr::Body,
            ],
            FetchSpec::Attrs(attrs) => attrs.clone(),
        }
    }
}

/// CONDSTORE/QRESYNC fetch modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchMods {
    pub changedsince: Option<u64>,
    pub vanished: bool,
}

impl FetchMods {
    /// VANISHED needs CHANGEDSINCE and only exists in UID mode.
    pub fn validate(&self, uid_mode: bool) -> Result<(), ImapError> {
        if self.vanished && self.changedsince.is_none() {
            return Err(ImapError::Value(
                "FETCH VANISHED requires CHANGEDSINCE".into(),
            ));
        }
        if self.vanished && !uid_mode {
            return Err(ImapError::Value("FETCH VANISHED requires UID mode".into()));
        }
        Ok(())
    }
}

/// STORE's `+FLAGS`/`-FLAGS`/`FLAGS` selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSign {
    Add,
    Remove,
    Replace,
}
