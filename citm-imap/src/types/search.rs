use crate::types::core::IString;
use crate::types::sequence::SeqSet;

/// A date without a time-of-day, as used by BEFORE/ON/SINCE keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchDate {
    pub year: u32,
    pub month: u32,
    pub day: u32,
}

/// A MODSEQ search entry (`"/flags/\Seen" priv|shared|all`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModseqEntry {
    pub name: IString,
    pub kind: ModseqEntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModseqEntryKind {
    Priv,
    Shared,
    All,
}

/// The recursive search-key grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    All,
    Answered,
    Deleted,
    Flagged,
    New,
    Old,
    Recent,
    Seen,
    Unanswered,
    Undeleted,
    Unflagged,
    Unseen,
    Draft,
    Undraft,
    Bcc(IString),
    Body(IString),
    Cc(IString),
    From(IString),
    Subject(IString),
    Text(IString),
    To(IString),
    Header(IString, IString),
    Keyword(String),
    Unkeyword(String),
    Before(SearchDate),
    On(SearchDate),
    Since(SearchDate),
    SentBefore(SearchDate),
    SentOn(SearchDate),
    SentSince(SearchDate),
    Larger(u32),
    Smaller(u32),
    Uid(SeqSet),
    SeqSet(SeqSet),
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    /// A parenthesized conjunction.
    Group(Vec<SearchKey>),
    /// CONDSTORE: MODSEQ [entry-name entry-type] modseq.
    Modseq(Option<ModseqEntry>, u64),
}
