use std::fmt;

use crate::error::ImapError;

/// The extensions this codec understands beyond IMAP4rev1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ext {
    Uidplus,
    Enable,
    Condstore,
    Qresync,
    Unselect,
    Idle,
    LiteralPlus,
    Xkey,
}

impl Ext {
    /// The capability token for this extension.
    pub fn token(self) -> &'static str {
        match self {
            Ext::Uidplus => "UIDPLUS",
            Ext::Enable => "ENABLE",
            Ext::Condstore => "CONDSTORE",
            Ext::Qresync => "QRESYNC",
            Ext::Unselect => "UNSELECT",
            Ext::Idle => "IDLE",
            Ext::LiteralPlus => "LITERAL+",
            Ext::Xkey => "XKEY",
        }
    }
}

impl fmt::Display for Ext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Negotiation state of one extension on one session.
///
/// Some extensions are usable as soon as both sides advertise them, so
/// `Off` does not mean forbidden; only `Disabled` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtState {
    /// The peer forbids this extension; using it is an error.
    Disabled,
    /// Available but not yet negotiated.
    #[default]
    Off,
    /// Negotiated and in use.
    On,
}

/// Per-session record of every extension's state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Extensions {
    pub uidplus: ExtState,
    pub enable: ExtState,
    pub condstore: ExtState,
    pub qresync: ExtState,
    pub unselect: ExtState,
    pub idle: ExtState,
    pub literal_plus: ExtState,
    pub xkey: ExtState,
}

impl Extensions {
    /// All extensions available (the state we offer to downstream clients).
    pub fn all_available() -> Self {
        Extensions::default()
    }

    /// All extensions disabled (the state before a capability exchange).
    pub fn all_disabled() -> Self {
        Extensions {
            uidplus: ExtState::Disabled,
            enable: ExtState::Disabled,
            condstore: ExtState::Disabled,
            qresync: ExtState::Disabled,
            unselect: ExtState::Disabled,
            idle: ExtState::Disabled,
            literal_plus: ExtState::Disabled,
            xkey: ExtState::Disabled,
        }
    }

    pub fn get(&self, ext: Ext) -> ExtState {
        match ext {
            Ext::Uidplus => self.uidplus,
            Ext::Enable => self.enable,
            Ext::Condstore => self.condstore,
            Ext::Qresync => self.qresync,
            Ext::Unselect => self.unselect,
            Ext::Idle => self.idle,
            Ext::LiteralPlus => self.literal_plus,
            Ext::Xkey => self.xkey,
        }
    }

    fn get_mut(&mut self, ext: Ext) -> &mut ExtState {
        match ext {
            Ext::Uidplus => &mut self.uidplus,
            Ext::Enable => &mut self.enable,
            Ext::Condstore => &mut self.condstore,
            Ext::Qresync => &mut self.qresync,
            Ext::Unselect => &mut self.unselect,
            Ext::Idle => &mut self.idle,
            Ext::LiteralPlus => &mut self.literal_plus,
            Ext::Xkey => &mut self.xkey,
        }
    }

    pub fn is_on(&self, ext: Ext) -> bool {
        self.get(ext) == ExtState::On
    }

    pub fn is_available(&self, ext: Ext) -> bool {
        self.get(ext) != ExtState::Disabled
    }

    /// Fail if the extension is disabled; `Off` passes silently.
    pub fn assert_available(&self, ext: Ext) -> Result<(), ImapError> {
        if self.is_available(ext) {
            Ok(())
        } else {
            Err(ImapError::ExtensionDisabled(ext))
        }
    }

    /// Fail unless the extension has actually been negotiated on.
    pub fn assert_on(&self, ext: Ext) -> Result<(), ImapError> {
        if self.is_on(ext) {
            Ok(())
        } else {
            Err(ImapError::ExtensionDisabled(ext))
        }
    }

    /// Flip an extension to `On`; returns false if it was disabled.
    pub fn trigger(&mut self, ext: Ext) -> bool {
        let state = self.get_mut(ext);
        if *state == ExtState::Disabled {
            return false;
        }
        *state = ExtState::On;
        // QRESYNC implies CONDSTORE
        if ext == Ext::Qresync && self.condstore != ExtState::Disabled {
            self.condstore = ExtState::On;
        }
        true
    }

    pub fn set(&mut self, ext: Ext, state: ExtState) {
        *self.get_mut(ext) = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_respects_disabled() {
        let mut exts = Extensions::all_disabled();
        assert!(!exts.trigger(Ext::Condstore));
        exts.set(Ext::Condstore, ExtState::Off);
        assert!(exts.trigger(Ext::Condstore));
        assert!(exts.is_on(Ext::Condstore));
    }

    #[test]
    fn qresync_implies_condstore() {
        let mut exts = Extensions::all_available();
        exts.trigger(Ext::Qresync);
        assert!(exts.is_on(Ext::Condstore));
    }

    #[test]
    fn assert_levels() {
        let mut exts = Extensions::all_available();
        assert!(exts.assert_available(Ext::Idle).is_ok());
        assert!(exts.assert_on(Ext::Idle).is_err());
        exts.trigger(Ext::Idle);
        assert!(exts.assert_on(Ext::Idle).is_ok());
    }
}
