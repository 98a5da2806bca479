/// Flag records.
///
/// Each context (message flags, FETCH flags, PERMANENTFLAGS, mailbox
/// attributes) gets its own record: a fixed set of named booleans plus
/// two ordered lists, one for keywords (bare atoms) and one for
/// extension flags (unrecognized `\Atom`s).

/// Flags as they appear in APPEND and STORE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub seen: bool,
    pub draft: bool,
    pub keywords: Vec<String>,
    pub extensions: Vec<String>,
}

/// Flags as they appear in FETCH responses (adds `\Recent`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchFlags {
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub seen: bool,
    pub draft: bool,
    pub recent: bool,
    pub keywords: Vec<String>,
    pub extensions: Vec<String>,
}

/// Flags as they appear in a PERMANENTFLAGS code (adds `\*`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermFlags {
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub seen: bool,
    pub draft: bool,
    pub asterisk: bool,
    pub keywords: Vec<String>,
    pub extensions: Vec<String>,
}

/// Mailbox attributes as they appear in LIST/LSUB responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxFlags {
    pub noinferiors: bool,
    pub noselect: bool,
    pub marked: bool,
    pub unmarked: bool,
    pub extensions: Vec<String>,
}

impl Flags {
    pub fn is_empty(&self) -> bool {
        !(self.answered || self.flagged || self.deleted || self.seen || self.draft)
            && self.keywords.is_empty()
            && self.extensions.is_empty()
    }

    /// Set one system flag or file the name under keywords/extensions.
    pub fn add(&mut self, name: &str, backslash: bool) {
        if backslash {
            match_system_flag(name, &mut self.answered, &mut self.flagged, &mut self.deleted,
                &mut self.seen, &mut self.draft)
                .unwrap_or_else(|| self.extensions.push(name.to_string()));
        } else {
            self.keywords.push(name.to_string());
        }
    }
}

impl FetchFlags {
    pub fn add(&mut self, name: &str, backslash: bool) {
        if backslash {
            if name.eq_ignore_ascii_case("Recent") {
                self.recent = true;
                return;
            }
            match_system_flag(name, &mut self.answered, &mut self.flagged, &mut self.deleted,
                &mut self.seen, &mut self.draft)
                .unwrap_or_else(|| self.extensions.push(name.to_string()));
        } else {
            self.keywords.push(name.to_string());
        }
    }
}

impl PermFlags {
    pub fn add(&mut self, name: &str, backslash: bool) {
        if backslash {
            if name == "*" {
                self.asterisk = true;
                return;
            }
            match_system_flag(name, &mut self.answered, &mut self.flagged, &mut self.deleted,
                &mut self.seen, &mut self.draft)
                .unwrap_or_else(|| self.extensions.push(name.to_string()));
        } else {
            self.keywords.push(name.to_string());
        }
    }
}

impl MailboxFlags {
    pub fn add(&mut self, name: &str) {
        if name.eq_ignore_ascii_case("Noinferiors") {
            self.noinferiors = true;
        } else if name.eq_ignore_ascii_case("Noselect") {
            self.noselect = true;
        } else if name.eq_ignore_ascii_case("Marked") {
            self.marked = true;
        } else if name.eq_ignore_ascii_case("Unmarked") {
            self.unmarked = true;
        } else {
            self.extensions.push(name.to_string());
        }
    }
}

/// Returns Some(()) if `name` was a system flag and got set.
fn match_system_flag(
    name: &str,
    answered: &mut bool,
    flagged: &mut bool,
    deleted: &mut bool,
    seen: &mut bool,
    draft: &mut bool,
) -> Option<()> {
    if name.eq_ignore_ascii_case("Answered") {
        *answered = true;
    } else if name.eq_ignore_ascii_case("Flagged") {
        *flagged = true;
    } else if name.eq_ignore_ascii_case("Deleted") {
        *deleted = true;
    } else if name.eq_ignore_ascii_case("Seen") {
        *seen = true;
    } else if name.eq_ignore_ascii_case("Draft") {
        *draft = true;
    } else {
        return None;
    }
    Some(())
}
