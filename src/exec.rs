use std::fmt::{Display, Formatter};
use tokio::sync::mpsc;
use tracing::debug;

const SCROLLBACK_ROWS: usize = 1_000;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SessionKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pod, self.container)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionStatus {
    Connecting,
    Running,
    Terminating,
    Deleted,
}

impl SessionStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Deleted => "DELETED",
        }
    }
}

pub struct ExecSession {
    pub id: u64,
    pub key: SessionKey,
    pub status: SessionStatus,
    pub resource_version: String,
    screen: vt100::Parser,
    input: Option<mpsc::Sender<Vec<u8>>>,
    resize: Option<mpsc::Sender<(u16, u16)>>,
}

impl ExecSession {
    pub fn screen(&self) -> &vt100::Screen {
        self.screen.screen()
    }

    pub fn is_attached(&self) -> bool {
        self.input.is_some()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpenOutcome {
    Focused(u64),
    Created(u64),
}

pub struct ExecSessions {
    sessions: Vec<ExecSession>,
    next_id: u64,
    focused: Option<u64>,
    size: (u16, u16),
}

impl Default for ExecSessions {
    fn default() -> Self {
        Self {
            sessions: Vec::new(),
            next_id: 1,
            focused: None,
            size: (80, 24),
        }
    }
}

impl ExecSessions {
    pub fn open(&mut self, key: SessionKey) -> OpenOutcome {
        if let Some(existing) = self.sessions.iter().find(|session| session.key == key) {
            let id = existing.id;
            self.focused = Some(id);
            return OpenOutcome::Focused(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        let (cols, rows) = self.size;
        debug!(session = id, target = %key, "opening shell tab");
        self.sessions.push(ExecSession {
            id,
            key,
            status: SessionStatus::Connecting,
            resource_version: String::new(),
            screen: vt100::Parser::new(rows, cols, SCROLLBACK_ROWS),
            input: None,
            resize: None,
        });
        self.focused = Some(id);
        OpenOutcome::Created(id)
    }

    pub fn attach(
        &mut self,
        id: u64,
        input: mpsc::Sender<Vec<u8>>,
        resize: mpsc::Sender<(u16, u16)>,
    ) -> bool {
        let size = self.size;
        let Some(session) = self.get_mut(id) else {
            return false;
        };
        let _ = resize.try_send(size);
        session.input = Some(input);
        session.resize = Some(resize);
        if session.status == SessionStatus::Connecting {
            session.status = SessionStatus::Running;
        }
        true
    }

    pub fn feed(&mut self, id: u64, bytes: &[u8]) {
        if let Some(session) = self.get_mut(id)
            && !bytes.is_empty()
        {
            session.screen.process(bytes);
        }
    }

    pub fn set_status(&mut self, id: u64, status: SessionStatus) {
        if let Some(session) = self.get_mut(id) {
            session.status = status;
        }
    }

    pub fn note_version(&mut self, id: u64, resource_version: Option<String>) {
        if let (Some(session), Some(version)) = (self.get_mut(id), resource_version) {
            session.resource_version = version;
        }
    }

    pub fn close(&mut self, id: u64) -> Option<ExecSession> {
        let position = self.sessions.iter().position(|session| session.id == id)?;
        let removed = self.sessions.remove(position);
        if self.focused == Some(id) {
            self.focused = self
                .sessions
                .get(position)
                .or_else(|| self.sessions.last())
                .map(|session| session.id);
        }
        Some(removed)
    }

    pub fn send_input(&self, id: u64, bytes: Vec<u8>) -> bool {
        self.get(id)
            .and_then(|session| session.input.as_ref())
            .is_some_and(|input| input.try_send(bytes).is_ok())
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 || self.size == (cols, rows) {
            return;
        }
        self.size = (cols, rows);
        for session in &mut self.sessions {
            session.screen.screen_mut().set_size(rows, cols);
            if let Some(resize) = session.resize.as_ref() {
                let _ = resize.try_send((cols, rows));
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&ExecSession> {
        self.sessions.iter().find(|session| session.id == id)
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut ExecSession> {
        self.sessions.iter_mut().find(|session| session.id == id)
    }

    pub fn sessions(&self) -> &[ExecSession] {
        &self.sessions
    }

    pub fn ids(&self) -> Vec<u64> {
        self.sessions.iter().map(|session| session.id).collect()
    }

    pub fn focused(&self) -> Option<u64> {
        self.focused
    }

    pub fn focus(&mut self, id: Option<u64>) {
        self.focused = id.filter(|id| self.get(*id).is_some());
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecSessions, OpenOutcome, SessionKey, SessionStatus};
    use tokio::sync::mpsc;

    fn key(pod: &str, container: &str) -> SessionKey {
        SessionKey {
            namespace: "default".to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
        }
    }

    #[test]
    fn duplicate_request_focuses_existing_tab() {
        let mut sessions = ExecSessions::default();
        let OpenOutcome::Created(first) = sessions.open(key("api", "app")) else {
            panic!("first open should create a session");
        };
        let OpenOutcome::Created(second) = sessions.open(key("api", "sidecar")) else {
            panic!("other container should create a session");
        };
        assert_eq!(sessions.focused(), Some(second));

        assert_eq!(sessions.open(key("api", "app")), OpenOutcome::Focused(first));
        assert_eq!(sessions.focused(), Some(first));
        assert_eq!(sessions.sessions().len(), 2);
    }

    #[test]
    fn attach_marks_running_and_forwards_input() {
        let mut sessions = ExecSessions::default();
        let OpenOutcome::Created(id) = sessions.open(key("api", "app")) else {
            panic!("expected a new session");
        };
        assert!(!sessions.send_input(id, b"ls\r".to_vec()));

        let (input_tx, mut input_rx) = mpsc::channel(4);
        let (resize_tx, mut resize_rx) = mpsc::channel(4);
        assert!(sessions.attach(id, input_tx, resize_tx));
        assert_eq!(sessions.get(id).map(|s| s.status), Some(SessionStatus::Running));
        assert_eq!(resize_rx.try_recv().ok(), Some((80, 24)));

        assert!(sessions.send_input(id, b"ls\r".to_vec()));
        assert_eq!(input_rx.try_recv().ok(), Some(b"ls\r".to_vec()));

        sessions.resize(120, 40);
        assert_eq!(resize_rx.try_recv().ok(), Some((120, 40)));
    }

    #[test]
    fn output_feeds_the_screen() {
        let mut sessions = ExecSessions::default();
        let OpenOutcome::Created(id) = sessions.open(key("api", "app")) else {
            panic!("expected a new session");
        };
        sessions.feed(id, b"hello\r\nworld");
        let screen = sessions.get(id).map(|s| s.screen().contents()).unwrap_or_default();
        assert!(screen.starts_with("hello\nworld"));
    }

    #[test]
    fn closing_moves_focus_to_a_neighbour() {
        let mut sessions = ExecSessions::default();
        sessions.open(key("a", "c"));
        sessions.open(key("b", "c"));
        sessions.open(key("c", "c"));
        sessions.focus(Some(2));

        assert!(sessions.close(2).is_some());
        assert_eq!(sessions.focused(), Some(3));
        assert!(sessions.close(3).is_some());
        assert_eq!(sessions.focused(), Some(1));
        assert!(sessions.close(3).is_none());

        sessions.set_status(1, SessionStatus::Deleted);
        assert_eq!(sessions.get(1).map(|s| s.status.label()), Some("DELETED"));
    }
}
