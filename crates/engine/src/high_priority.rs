//! High-priority execution context
//!
//! Turns an ordinary session into an applier session for as long as the
//! context lives. Every attribute in [`SessionAttrs`] plus the session mode
//! is shadowed on construction and restored by `Drop`, whatever path the
//! owner leaves by.
//!
//! While the context is alive the session:
//! - does not write to the general log and writes to the change log only
//!   when `log_replicated_changes` is set
//! - has no network channel and no current database
//! - runs at read committed inside a pseudo-transaction scope
//! - refuses ordinary kill requests

use crate::config::ReplicationConfig;
use replicore_concurrency::{
    IsolationLevel, OptionBits, ServerStatus, Session, SessionAttrs, SessionMode,
};
use replicore_core::{FormatDescription, WsMeta};
use std::sync::Arc;
use tracing::debug;

/// Relay-log info of an applier: the format used when a write-set carries
/// no format description of its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLogInfo {
    format: FormatDescription,
}

impl RelayLogInfo {
    /// Relay-log info with the default v4 format
    pub fn new() -> Self {
        Self {
            format: FormatDescription::v4(),
        }
    }

    /// Default format
    pub fn format(&self) -> &FormatDescription {
        &self.format
    }
}

impl Default for RelayLogInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped applier mode of a session
#[derive(Debug)]
pub struct HighPriorityContext {
    session: Arc<Session>,
    shadow: SessionAttrs,
    shadow_mode: SessionMode,
    rli: RelayLogInfo,
    must_exit: bool,
}

impl HighPriorityContext {
    /// Enter applier mode on `session`
    pub fn new(session: Arc<Session>, config: &ReplicationConfig) -> Self {
        let (shadow, shadow_mode) = {
            let mut state = session.lock();
            let shadow = state.attrs.clone();
            let shadow_mode = state.mode;

            let attrs = &mut state.attrs;
            attrs.option_bits.insert(OptionBits::LOG_OFF);
            attrs
                .option_bits
                .set(OptionBits::BIN_LOG, config.log_replicated_changes);
            attrs.channel = None;
            attrs.db = None;
            attrs.isolation = IsolationLevel::ReadCommitted;
            attrs.option_bits.insert(OptionBits::BEGIN);
            attrs.server_status.set(ServerStatus::IN_TRANS, true);
            attrs.non_killable = true;

            state.diagnostics.reset();
            state.mode = SessionMode::HighPriority;
            state.proc_info = "applier idle";
            (shadow, shadow_mode)
        };
        debug!(target: "replicore::applier", session = session.id(), "entered high priority mode");

        Self {
            session,
            shadow,
            shadow_mode,
            rli: RelayLogInfo::new(),
            must_exit: false,
        }
    }

    /// The session in applier mode
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Relay-log info
    pub fn rli(&self) -> &RelayLogInfo {
        &self.rli
    }

    /// Attributes the session had before entering applier mode
    pub fn shadow(&self) -> &SessionAttrs {
        &self.shadow
    }

    /// The owning thread should stop after the current write-set
    pub fn must_exit(&self) -> bool {
        self.must_exit
    }

    /// Record whether the owning thread should stop
    pub fn set_must_exit(&mut self, must_exit: bool) {
        self.must_exit = must_exit;
    }
}

impl Drop for HighPriorityContext {
    fn drop(&mut self) {
        let mut state = self.session.lock();
        state.attrs = self.shadow.clone();
        state.mode = self.shadow_mode;
        state.proc_info = "idle";
        drop(state);
        debug!(target: "replicore::applier", session = self.session.id(), "left high priority mode");
    }
}

/// Apply the configured constraint check policy to `session`
pub fn setup_key_checks(session: &Session, config: &ReplicationConfig) {
    let mut state = session.lock();
    state
        .attrs
        .option_bits
        .set(OptionBits::RELAXED_UNIQUE_CHECKS, !config.unique_key_checks);
    state
        .attrs
        .option_bits
        .set(OptionBits::NO_FOREIGN_KEY_CHECKS, !config.foreign_key_checks);
}

/// Scoped non-transactional mode for total-order actions
///
/// Leaves the pseudo-transaction scope and enters total-order mode; the
/// previous option bits, server status and mode come back on drop.
#[derive(Debug)]
pub struct NonTransMode<'a> {
    session: &'a Session,
    option_bits: OptionBits,
    server_status: ServerStatus,
    mode: SessionMode,
}

impl<'a> NonTransMode<'a> {
    /// Enter total-order mode for `meta`
    pub fn new(session: &'a Session, meta: &WsMeta) -> Self {
        let mut state = session.lock();
        let guard = Self {
            session,
            option_bits: state.attrs.option_bits,
            server_status: state.attrs.server_status,
            mode: state.mode,
        };
        state.attrs.option_bits.remove(OptionBits::BEGIN);
        state.attrs.server_status.set(ServerStatus::IN_TRANS, false);
        state.mode = SessionMode::TotalOrder;
        drop(state);
        debug!(target: "replicore::applier", session = session.id(), seqno = meta.seqno().get(), "entered total order");
        guard
    }
}

impl Drop for NonTransMode<'_> {
    fn drop(&mut self) {
        let mut state = self.session.lock();
        state.attrs.option_bits = self.option_bits;
        state.attrs.server_status = self.server_status;
        state.mode = self.mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicore_concurrency::{ChannelId, KillState};
    use replicore_core::{Gtid, Seqno};

    fn client_session() -> Arc<Session> {
        let session = Arc::new(Session::new(9));
        {
            let mut state = session.lock();
            state.attrs.channel = Some(ChannelId(42));
            state.attrs.db = Some("shop".to_string());
            state.attrs.row_count = 3;
            state.attrs.server_status.set(ServerStatus::AUTOCOMMIT, true);
            state.diagnostics.set_error(1146, "Table 'shop.t' doesn't exist");
        }
        session
    }

    #[test]
    fn test_context_overrides_attributes() {
        let session = client_session();
        let ctx = HighPriorityContext::new(Arc::clone(&session), &ReplicationConfig::default());

        let state = session.lock();
        assert!(state.attrs.option_bits.contains(OptionBits::LOG_OFF | OptionBits::BEGIN));
        assert!(!state.attrs.option_bits.contains(OptionBits::BIN_LOG));
        assert!(state.attrs.server_status.contains(ServerStatus::IN_TRANS));
        assert_eq!(state.attrs.channel, None);
        assert_eq!(state.attrs.db, None);
        assert_eq!(state.attrs.isolation, IsolationLevel::ReadCommitted);
        assert!(state.attrs.non_killable);
        assert!(!state.diagnostics.is_error());
        assert_eq!(state.mode, SessionMode::HighPriority);
        drop(state);

        assert_eq!(ctx.shadow().db.as_deref(), Some("shop"));
        assert_eq!(ctx.rli().format(), &FormatDescription::v4());
    }

    #[test]
    fn test_log_replicated_changes_sets_bin_log() {
        let session = client_session();
        let config = ReplicationConfig {
            log_replicated_changes: true,
            ..ReplicationConfig::default()
        };
        let _ctx = HighPriorityContext::new(Arc::clone(&session), &config);
        assert!(session.lock().attrs.option_bits.contains(OptionBits::BIN_LOG));
    }

    #[test]
    fn test_drop_restores_everything() {
        let session = client_session();
        let before = session.lock().attrs.clone();
        {
            let _ctx = HighPriorityContext::new(Arc::clone(&session), &ReplicationConfig::default());
            assert!(!session.kill(KillState::Connection));
            session.lock().attrs.row_count = 99;
        }
        let state = session.lock();
        assert_eq!(state.attrs, before);
        assert_eq!(state.mode, SessionMode::Local);
    }

    #[test]
    fn test_drop_restores_on_early_return() {
        fn fails(session: &Arc<Session>) -> Result<(), &'static str> {
            let _ctx = HighPriorityContext::new(Arc::clone(session), &ReplicationConfig::default());
            Err("apply failed")
        }
        let session = client_session();
        let before = session.lock().attrs.clone();
        assert!(fails(&session).is_err());
        assert_eq!(session.lock().attrs, before);
    }

    #[test]
    fn test_key_checks_follow_config() {
        let session = Arc::new(Session::new(1));
        let config = ReplicationConfig {
            unique_key_checks: false,
            ..ReplicationConfig::default()
        };
        setup_key_checks(&session, &config);
        let bits = session.lock().attrs.option_bits;
        assert!(bits.contains(OptionBits::RELAXED_UNIQUE_CHECKS));
        assert!(!bits.contains(OptionBits::NO_FOREIGN_KEY_CHECKS));

        setup_key_checks(&session, &ReplicationConfig::default());
        assert!(!session
            .lock()
            .attrs
            .option_bits
            .contains(OptionBits::RELAXED_UNIQUE_CHECKS));
    }

    #[test]
    fn test_non_trans_mode() {
        let session = client_session();
        let _ctx = HighPriorityContext::new(Arc::clone(&session), &ReplicationConfig::default());
        let meta = WsMeta {
            gtid: Gtid::new(Default::default(), Seqno::new(4)),
            ..WsMeta::default()
        };
        {
            let _toi = NonTransMode::new(&session, &meta);
            let state = session.lock();
            assert!(!state.attrs.option_bits.contains(OptionBits::BEGIN));
            assert!(!state.attrs.server_status.contains(ServerStatus::IN_TRANS));
            assert_eq!(state.mode, SessionMode::TotalOrder);
        }
        let state = session.lock();
        assert!(state.attrs.option_bits.contains(OptionBits::BEGIN));
        assert_eq!(state.mode, SessionMode::HighPriority);
    }
}
