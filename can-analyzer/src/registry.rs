//! Process-wide session registry

use crate::config::SessionConfig;
use crate::error::{AnalyzerError, Result};
use crate::session::CanSession;
use crate::shared::{read, write};
use crate::transport::TransportFactory;
use std::sync::{Arc, RwLock};

/// Every open session of the process, in open order
///
/// Sessions are independent: the registry lock is only held while the list
/// itself is read or changed, never while a session starts or stops.
pub struct SessionRegistry {
    factory: Arc<dyn TransportFactory>,
    sessions: RwLock<Vec<Arc<CanSession>>>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// Open a stopped session; display names are unique
    pub fn open(&self, config: SessionConfig) -> Result<Arc<CanSession>> {
        let mut sessions = write(&self.sessions);
        if sessions.iter().any(|s| s.name() == config.name) {
            return Err(AnalyzerError::DuplicateSessionName(config.name));
        }

        let session = Arc::new(CanSession::open(config, Arc::clone(&self.factory))?);
        sessions.push(Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<CanSession>> {
        read(&self.sessions).iter().find(|s| s.id() == id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<CanSession>> {
        read(&self.sessions)
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<CanSession>> {
        read(&self.sessions).clone()
    }

    pub fn len(&self) -> usize {
        read(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.sessions).is_empty()
    }

    /// Close a session and remove it
    pub fn close(&self, id: &str) -> Result<()> {
        let session = {
            let mut sessions = write(&self.sessions);
            let index = sessions
                .iter()
                .position(|s| s.id() == id)
                .ok_or_else(|| AnalyzerError::NotFound(format!("session {}", id)))?;
            sessions.remove(index)
        };
        session.close();
        log::info!("[session {}] Closed", id);
        Ok(())
    }

    /// Stop every session, keeping them open
    pub fn stop_all(&self) {
        for session in self.sessions() {
            session.stop();
        }
    }

    /// Close and remove every session
    pub fn shutdown(&self) {
        let sessions = std::mem::take(&mut *write(&self.sessions));
        log::info!("Shutting down {} sessions", sessions.len());
        for session in sessions {
            session.close();
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use crate::transport::VirtualBus;
    use crate::types::SessionState;

    fn config(name: &str, channel: &str) -> SessionConfig {
        SessionConfig::new(name, InterfaceConfig::virtual_channel(channel))
    }

    #[test]
    fn test_names_are_unique() {
        let registry = SessionRegistry::new(Arc::new(VirtualBus::new()));
        let a = registry.open(config("Powertrain", "vcan0")).unwrap();
        assert!(matches!(
            registry.open(config("Powertrain", "vcan1")),
            Err(AnalyzerError::DuplicateSessionName(_))
        ));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(a.id()).unwrap().name(), "Powertrain");
        assert!(registry.find_by_name("Powertrain").is_some());
    }

    #[test]
    fn test_close_removes_session() {
        let registry = SessionRegistry::new(Arc::new(VirtualBus::new()));
        let a = registry.open(config("A", "vcan0")).unwrap();
        let b = registry.open(config("B", "vcan1")).unwrap();
        a.start().unwrap();

        registry.close(a.id()).unwrap();
        assert_eq!(a.state(), SessionState::Closed);
        assert!(registry.get(a.id()).is_none());
        assert!(matches!(
            registry.close(a.id()),
            Err(AnalyzerError::NotFound(_))
        ));
        assert_eq!(registry.sessions()[0].id(), b.id());
    }

    #[test]
    fn test_stop_all_and_shutdown() {
        let registry = SessionRegistry::new(Arc::new(VirtualBus::new()));
        let a = registry.open(config("A", "vcan0")).unwrap();
        let b = registry.open(config("B", "vcan1")).unwrap();
        a.start().unwrap();
        b.start().unwrap();

        registry.stop_all();
        assert_eq!(a.state(), SessionState::Stopped);
        assert_eq!(b.state(), SessionState::Stopped);

        registry.shutdown();
        assert!(registry.is_empty());
        assert_eq!(b.state(), SessionState::Closed);
    }
}
