//! Support-chat relay between agents and requesters.
//!
//! A session becomes an agent by announcing a name, or a requester by asking
//! for an agent. Requesters are bound to agent *names*, so a binding survives
//! the agent reconnecting under the same name. Delivery is best-effort and
//! at-most-once: nothing is queued, retried or persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use campusdock_protocol::ServerMessage;
use thiserror::Error;
use tracing::{debug, info};

use crate::registry::SessionRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("agent name must not be empty")]
    InvalidAgentName,
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidAgentName => "invalid_agent_name",
        }
    }
}

/// Role of a session as seen by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRole {
    Unbound,
    AgentActive { name: String },
    /// `preferred` is None when the requester accepts any agent
    RequesterWaiting { preferred: Option<String> },
    RequesterBound { agent: String },
}

#[derive(Debug)]
struct AgentSlot {
    /// None once the agent disconnected; the name stays registered.
    session: Option<String>,
    /// Order in which the name was first announced, for "first available".
    registered_seq: u64,
}

#[derive(Debug, Default)]
struct RelayState {
    agents: HashMap<String, AgentSlot>,
    agent_by_session: HashMap<String, String>,
    /// requester session → agent name (None: waiting for any agent)
    requesters: BTreeMap<String, Option<String>>,
    next_seq: u64,
}

impl RelayState {
    /// Resolve a name to a live session, clearing the slot if it went stale.
    fn live_agent(&mut self, name: &str, registry: &SessionRegistry) -> Option<String> {
        let slot = self.agents.get_mut(name)?;
        let session = slot.session.clone()?;
        if registry.contains(&session) {
            return Some(session);
        }
        debug!(
            component = "relay",
            event = "relay.agent.stale_cleared",
            agent = %name,
            session_id = %session,
            "Clearing stale agent binding"
        );
        slot.session = None;
        if self.agent_by_session.get(&session).map(String::as_str) == Some(name) {
            self.agent_by_session.remove(&session);
        }
        None
    }

    fn first_available(&mut self, registry: &SessionRegistry) -> Option<String> {
        let mut names: Vec<(u64, String)> = self
            .agents
            .iter()
            .filter(|(_, slot)| slot.session.is_some())
            .map(|(name, slot)| (slot.registered_seq, name.clone()))
            .collect();
        names.sort();
        names
            .into_iter()
            .find(|(_, name)| self.live_agent(name, registry).is_some())
            .map(|(_, name)| name)
    }

    fn is_live(&self, name: &str, registry: &SessionRegistry) -> bool {
        self.agents
            .get(name)
            .and_then(|slot| slot.session.as_deref())
            .is_some_and(|session| registry.contains(session))
    }
}

type Outbox = Vec<(String, ServerMessage)>;

/// Agent/requester pairing over the session registry
pub struct ChatRelay {
    registry: Arc<SessionRegistry>,
    state: Mutex<RelayState>,
}

impl ChatRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(RelayState::default()),
        }
    }

    /// Bind `name` to `session_id` (last writer wins) and tell every requester
    /// that an agent is available.
    pub fn announce_agent(&self, session_id: &str, name: &str) -> Result<(), RelayError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RelayError::InvalidAgentName);
        }

        let mut outbox = Outbox::new();
        let replaced = {
            let mut st = self.state();

            // A session announcing a new name gives up the old one.
            if let Some(previous) = st
                .agent_by_session
                .insert(session_id.to_string(), name.to_string())
            {
                if previous != name {
                    if let Some(slot) = st.agents.get_mut(&previous) {
                        if slot.session.as_deref() == Some(session_id) {
                            slot.session = None;
                        }
                    }
                }
            }

            let seq = st.next_seq;
            let (replaced, is_new) = {
                let slot = st.agents.entry(name.to_string()).or_insert(AgentSlot {
                    session: None,
                    registered_seq: seq,
                });
                (
                    slot.session.replace(session_id.to_string()),
                    slot.registered_seq == seq,
                )
            };
            if is_new {
                st.next_seq += 1;
            }
            if let Some(old) = replaced.as_deref().filter(|old| *old != session_id) {
                if st.agent_by_session.get(old).map(String::as_str) == Some(name) {
                    st.agent_by_session.remove(old);
                }
            }

            for (requester, bound) in st.requesters.iter_mut() {
                if requester == session_id {
                    continue;
                }
                outbox.push((
                    requester.clone(),
                    ServerMessage::AgentAvailable {
                        name: name.to_string(),
                    },
                ));
                let waiting_here = match bound {
                    Some(bound) => bound.as_str() == name,
                    None => {
                        *bound = Some(name.to_string());
                        true
                    }
                };
                if waiting_here {
                    outbox.push((
                        session_id.to_string(),
                        ServerMessage::RequesterWaiting {
                            requester_session_id: requester.clone(),
                        },
                    ));
                }
            }

            replaced.filter(|old| old != session_id)
        };

        info!(
            component = "relay",
            event = "relay.agent.announced",
            agent = %name,
            session_id = %session_id,
            replaced_session = ?replaced,
            "Agent announced"
        );
        self.flush(outbox);
        Ok(())
    }

    /// Bind the requester to `preferred_name`, or to the earliest-registered
    /// live agent when no preference is given.
    pub fn request_agent(&self, session_id: &str, preferred_name: Option<&str>) {
        let preferred = preferred_name.map(str::trim).filter(|n| !n.is_empty());

        let mut outbox = Outbox::new();
        let bound = {
            let mut st = self.state();
            let name = match preferred {
                Some(name) => Some(name.to_string()),
                None => st.first_available(&self.registry),
            };
            st.requesters.insert(session_id.to_string(), name.clone());

            if let Some(name) = &name {
                if let Some(agent) = st.live_agent(name, &self.registry) {
                    outbox.push((
                        agent,
                        ServerMessage::RequesterWaiting {
                            requester_session_id: session_id.to_string(),
                        },
                    ));
                    outbox.push((
                        session_id.to_string(),
                        ServerMessage::AgentAvailable { name: name.clone() },
                    ));
                }
            }
            name
        };

        info!(
            component = "relay",
            event = "relay.requester.bound",
            session_id = %session_id,
            agent = ?bound,
            matched = !outbox.is_empty(),
            "Requester asked for an agent"
        );
        self.flush(outbox);
    }

    /// Forward requester text to its bound agent. False when there is no
    /// live agent to receive it; the message is dropped.
    pub fn relay_from_requester(&self, session_id: &str, text: &str) -> bool {
        let agent = {
            let mut st = self.state();
            match st.requesters.get(session_id).cloned().flatten() {
                Some(name) => st.live_agent(&name, &self.registry),
                None => None,
            }
        };

        let Some(agent) = agent else {
            debug!(
                component = "relay",
                event = "relay.message.dropped",
                session_id = %session_id,
                "No live agent for requester, message dropped"
            );
            return false;
        };

        self.registry.deliver(
            &agent,
            ServerMessage::ChatMessage {
                text: text.to_string(),
                from_session_id: Some(session_id.to_string()),
            },
        )
    }

    /// Forward agent text straight to a requester session.
    pub fn relay_from_agent(&self, to_session_id: &str, text: &str) -> bool {
        let delivered = self.registry.deliver(
            to_session_id,
            ServerMessage::ChatMessage {
                text: text.to_string(),
                from_session_id: None,
            },
        );
        if !delivered {
            debug!(
                component = "relay",
                event = "relay.message.dropped",
                to_session_id = %to_session_id,
                "Requester gone, agent message dropped"
            );
        }
        delivered
    }

    /// Release every binding held by a departing session.
    pub fn on_disconnect(&self, session_id: &str) {
        let mut outbox = Outbox::new();
        {
            let mut st = self.state();

            if let Some(name) = st.agent_by_session.remove(session_id) {
                if let Some(slot) = st.agents.get_mut(&name) {
                    if slot.session.as_deref() == Some(session_id) {
                        slot.session = None;
                        info!(
                            component = "relay",
                            event = "relay.agent.vacated",
                            agent = %name,
                            session_id = %session_id,
                            "Agent disconnected"
                        );
                    }
                }
            }

            if let Some(Some(name)) = st.requesters.remove(session_id) {
                if let Some(agent) = st.live_agent(&name, &self.registry) {
                    outbox.push((
                        agent,
                        ServerMessage::RequesterDisconnected {
                            requester_session_id: session_id.to_string(),
                        },
                    ));
                }
            }
        }
        self.flush(outbox);
    }

    pub fn role_of(&self, session_id: &str) -> SessionRole {
        let st = self.state();
        if let Some(name) = st.agent_by_session.get(session_id) {
            let active = st
                .agents
                .get(name)
                .is_some_and(|slot| slot.session.as_deref() == Some(session_id));
            if active {
                return SessionRole::AgentActive { name: name.clone() };
            }
        }
        match st.requesters.get(session_id) {
            Some(Some(name)) if st.is_live(name, &self.registry) => SessionRole::RequesterBound {
                agent: name.clone(),
            },
            Some(preferred) => SessionRole::RequesterWaiting {
                preferred: preferred.clone(),
            },
            None => SessionRole::Unbound,
        }
    }

    /// Live session currently bound to `name`, if any. A binding whose
    /// session has left the registry is cleared here.
    pub fn agent_binding(&self, name: &str) -> Option<String> {
        self.state().live_agent(name, &self.registry)
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, outbox: Outbox) {
        for (to, msg) in outbox {
            self.registry.deliver(&to, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{info, FakeTransport, RecordingDemand};

    struct Harness {
        registry: Arc<SessionRegistry>,
        relay: ChatRelay,
        transports: HashMap<String, Arc<FakeTransport>>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new(Arc::new(RecordingDemand::default())));
            Self {
                relay: ChatRelay::new(registry.clone()),
                registry,
                transports: HashMap::new(),
            }
        }

        fn connect(&mut self, id: &str) {
            let transport = Arc::new(FakeTransport::default());
            self.registry.register(info(id), transport.clone());
            self.transports.insert(id.to_string(), transport);
        }

        fn disconnect(&self, id: &str) {
            self.registry.remove(id);
            self.relay.on_disconnect(id);
        }

        fn inbox(&self, id: &str) -> Vec<ServerMessage> {
            self.transports[id].take()
        }
    }

    fn chat(text: &str, from: Option<&str>) -> ServerMessage {
        ServerMessage::ChatMessage {
            text: text.into(),
            from_session_id: from.map(str::to_string),
        }
    }

    #[test]
    fn reannounce_routes_to_latest_session_only() {
        let mut h = Harness::new();
        for id in ["s1", "s2", "r1"] {
            h.connect(id);
        }

        h.relay.announce_agent("s1", "A").unwrap();
        h.relay.announce_agent("s2", "A").unwrap();
        assert_eq!(h.relay.agent_binding("A").as_deref(), Some("s2"));

        h.relay.request_agent("r1", Some("A"));
        assert!(h.relay.relay_from_requester("r1", "hola"));

        assert!(h.inbox("s1").is_empty());
        let s2 = h.inbox("s2");
        assert_eq!(s2.last(), Some(&chat("hola", Some("r1"))));
        assert_eq!(h.relay.role_of("s1"), SessionRole::Unbound);
    }

    #[test]
    fn waiting_requester_is_matched_when_agent_announces() {
        let mut h = Harness::new();
        h.connect("r1");
        h.connect("a1");

        h.relay.request_agent("r1", Some("A"));
        assert_eq!(
            h.relay.role_of("r1"),
            SessionRole::RequesterWaiting {
                preferred: Some("A".into())
            }
        );
        assert!(h.inbox("r1").is_empty());

        h.relay.announce_agent("a1", "A").unwrap();
        assert_eq!(
            h.inbox("r1"),
            vec![ServerMessage::AgentAvailable { name: "A".into() }]
        );
        assert_eq!(
            h.inbox("a1"),
            vec![ServerMessage::RequesterWaiting {
                requester_session_id: "r1".into()
            }]
        );
        assert_eq!(
            h.relay.role_of("r1"),
            SessionRole::RequesterBound { agent: "A".into() }
        );
    }

    #[test]
    fn announce_broadcasts_to_requesters_of_other_agents() {
        let mut h = Harness::new();
        for id in ["a1", "b1", "r1"] {
            h.connect(id);
        }
        h.relay.announce_agent("a1", "A").unwrap();
        h.relay.request_agent("r1", Some("A"));
        h.inbox("r1");
        h.inbox("a1");

        h.relay.announce_agent("b1", "B").unwrap();
        assert_eq!(
            h.inbox("r1"),
            vec![ServerMessage::AgentAvailable { name: "B".into() }]
        );
        assert!(h.inbox("b1").is_empty());
        assert_eq!(
            h.relay.role_of("r1"),
            SessionRole::RequesterBound { agent: "A".into() }
        );
    }

    #[test]
    fn request_for_live_agent_notifies_both_sides() {
        let mut h = Harness::new();
        h.connect("a1");
        h.connect("r1");
        h.relay.announce_agent("a1", "A").unwrap();

        h.relay.request_agent("r1", Some("A"));
        assert_eq!(
            h.inbox("a1"),
            vec![ServerMessage::RequesterWaiting {
                requester_session_id: "r1".into()
            }]
        );
        assert_eq!(
            h.inbox("r1"),
            vec![ServerMessage::AgentAvailable { name: "A".into() }]
        );
    }

    #[test]
    fn message_to_disconnected_agent_is_dropped_silently() {
        let mut h = Harness::new();
        h.connect("a1");
        h.connect("r1");
        h.relay.announce_agent("a1", "A").unwrap();
        h.relay.request_agent("r1", Some("A"));
        h.inbox("r1");

        h.disconnect("a1");
        assert!(!h.relay.relay_from_requester("r1", "hello"));
        assert!(h.inbox("r1").is_empty());
        assert!(h.inbox("a1").iter().all(|m| !matches!(m, ServerMessage::ChatMessage { .. })));
        assert_eq!(h.relay.agent_binding("A"), None);
    }

    #[test]
    fn agent_binding_never_reports_a_departed_session() {
        let mut h = Harness::new();
        h.connect("a1");
        h.relay.announce_agent("a1", "A").unwrap();
        assert_eq!(h.relay.agent_binding("A").as_deref(), Some("a1"));

        // Removed from the registry, relay not yet told.
        h.registry.remove("a1");
        assert_eq!(h.relay.agent_binding("A"), None);
        assert_eq!(h.relay.role_of("a1"), SessionRole::Unbound);

        h.connect("a2");
        h.relay.announce_agent("a2", "A").unwrap();
        assert_eq!(h.relay.agent_binding("A").as_deref(), Some("a2"));
    }

    #[test]
    fn stale_agent_binding_is_cleared_on_lookup() {
        let mut h = Harness::new();
        h.connect("a1");
        h.connect("r1");
        h.relay.announce_agent("a1", "A").unwrap();
        h.relay.request_agent("r1", Some("A"));

        // Transport dropped without the relay hearing about it.
        h.registry.remove("a1");
        assert!(!h.relay.relay_from_requester("r1", "anyone?"));
        assert_eq!(h.relay.agent_binding("A"), None);
        assert_eq!(
            h.relay.role_of("r1"),
            SessionRole::RequesterWaiting {
                preferred: Some("A".into())
            }
        );
    }

    #[test]
    fn agent_reply_goes_to_named_session() {
        let mut h = Harness::new();
        h.connect("a1");
        h.connect("r1");

        assert!(h.relay.relay_from_agent("r1", "buenas"));
        assert_eq!(h.inbox("r1"), vec![chat("buenas", None)]);
        assert!(!h.relay.relay_from_agent("gone", "buenas"));
    }

    #[test]
    fn unbound_requester_message_is_dropped() {
        let mut h = Harness::new();
        h.connect("r1");
        assert!(!h.relay.relay_from_requester("r1", "hola"));
    }

    #[test]
    fn requester_disconnect_notifies_bound_agent() {
        let mut h = Harness::new();
        h.connect("a1");
        h.connect("r1");
        h.relay.announce_agent("a1", "A").unwrap();
        h.relay.request_agent("r1", Some("A"));
        h.inbox("a1");

        h.disconnect("r1");
        assert_eq!(
            h.inbox("a1"),
            vec![ServerMessage::RequesterDisconnected {
                requester_session_id: "r1".into()
            }]
        );
        assert_eq!(h.relay.role_of("r1"), SessionRole::Unbound);
    }

    #[test]
    fn vacated_name_can_be_announced_again_and_binding_survives() {
        let mut h = Harness::new();
        h.connect("a1");
        h.connect("r1");
        h.relay.announce_agent("a1", "A").unwrap();
        h.relay.request_agent("r1", Some("A"));

        h.disconnect("a1");
        assert_eq!(
            h.relay.role_of("r1"),
            SessionRole::RequesterWaiting {
                preferred: Some("A".into())
            }
        );

        h.connect("a2");
        h.relay.announce_agent("a2", "A").unwrap();
        assert!(h.relay.relay_from_requester("r1", "again"));
        assert_eq!(h.inbox("a2").last(), Some(&chat("again", Some("r1"))));
    }

    #[test]
    fn replaced_session_disconnecting_keeps_new_binding() {
        let mut h = Harness::new();
        h.connect("s1");
        h.connect("s2");
        h.relay.announce_agent("s1", "A").unwrap();
        h.relay.announce_agent("s2", "A").unwrap();

        h.disconnect("s1");
        assert_eq!(h.relay.agent_binding("A").as_deref(), Some("s2"));
        assert_eq!(
            h.relay.role_of("s2"),
            SessionRole::AgentActive { name: "A".into() }
        );
    }

    #[test]
    fn no_preference_picks_earliest_registered_live_agent() {
        let mut h = Harness::new();
        for id in ["b1", "a1", "r1", "r2"] {
            h.connect(id);
        }
        h.relay.announce_agent("b1", "B").unwrap();
        h.relay.announce_agent("a1", "A").unwrap();

        h.relay.request_agent("r1", None);
        assert_eq!(
            h.relay.role_of("r1"),
            SessionRole::RequesterBound { agent: "B".into() }
        );

        h.disconnect("b1");
        h.relay.request_agent("r2", None);
        assert_eq!(
            h.relay.role_of("r2"),
            SessionRole::RequesterBound { agent: "A".into() }
        );
    }

    #[test]
    fn any_agent_requester_binds_to_next_announcement() {
        let mut h = Harness::new();
        h.connect("r1");
        h.connect("a1");

        h.relay.request_agent("r1", None);
        assert_eq!(
            h.relay.role_of("r1"),
            SessionRole::RequesterWaiting { preferred: None }
        );

        h.relay.announce_agent("a1", "A").unwrap();
        assert_eq!(
            h.inbox("a1"),
            vec![ServerMessage::RequesterWaiting {
                requester_session_id: "r1".into()
            }]
        );
        assert!(h.relay.relay_from_requester("r1", "hi"));
    }

    #[test]
    fn renaming_agent_vacates_previous_name() {
        let mut h = Harness::new();
        h.connect("a1");
        h.relay.announce_agent("a1", "A").unwrap();
        h.relay.announce_agent("a1", "Soporte").unwrap();

        assert_eq!(h.relay.agent_binding("A"), None);
        assert_eq!(h.relay.agent_binding("Soporte").as_deref(), Some("a1"));
    }

    #[test]
    fn blank_agent_name_is_rejected() {
        let mut h = Harness::new();
        h.connect("a1");
        assert_eq!(
            h.relay.announce_agent("a1", "   "),
            Err(RelayError::InvalidAgentName)
        );
        assert_eq!(h.relay.role_of("a1"), SessionRole::Unbound);
    }
}
