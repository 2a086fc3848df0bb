use crate::input::Action;
use crate::model::PodRecord;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InputMode {
    Normal,
    Namespace,
    Shell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    None,
    SelectPod(String),
    OpenShell(String),
    CloseShell(u64),
    FocusShell(u64),
    SendToShell { session: u64, bytes: Vec<u8> },
    SwitchNamespace(String),
    ClearStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct Visible<'a> {
    pub pods: &'a [PodRecord],
    pub sessions: &'a [u64],
    pub focused_session: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct App {
    cluster: String,
    context: String,
    mode: InputMode,
    cursor: usize,
    page_size: usize,
    namespace_input: String,
    show_help: bool,
    pending_g: bool,
    status: String,
    running: bool,
}

impl App {
    pub fn new(cluster: String, context: String) -> Self {
        Self {
            cluster,
            context,
            mode: InputMode::Normal,
            cursor: 0,
            page_size: 10,
            namespace_input: String::new(),
            show_help: false,
            pending_g: false,
            status: "Connecting…".to_string(),
            running: true,
        }
    }

    pub fn apply_action(&mut self, action: Action, visible: Visible<'_>) -> AppCommand {
        if !matches!(action, Action::GPrefix) {
            self.pending_g = false;
        }

        if self.show_help && !matches!(action, Action::ToggleHelp | Action::Quit) {
            self.show_help = false;
            return AppCommand::None;
        }

        match action {
            Action::Quit => {
                self.running = false;
                self.status = "Exit requested".to_string();
                AppCommand::None
            }
            Action::Down => self.move_cursor(1, visible),
            Action::Up => self.move_cursor(-1, visible),
            Action::PageDown => self.move_cursor(self.page_size as isize, visible),
            Action::PageUp => self.move_cursor(-(self.page_size as isize), visible),
            Action::Top => self.move_cursor(isize::MIN / 2, visible),
            Action::Bottom => self.move_cursor(isize::MAX / 2, visible),
            Action::GPrefix => {
                if self.pending_g {
                    self.pending_g = false;
                    self.move_cursor(isize::MIN / 2, visible)
                } else {
                    self.pending_g = true;
                    AppCommand::None
                }
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                AppCommand::None
            }
            Action::SelectPod => match self.pod_at_cursor(visible) {
                Some(pod) => AppCommand::SelectPod(pod.uid.clone()),
                None => AppCommand::None,
            },
            Action::OpenShell => match self.pod_at_cursor(visible) {
                Some(pod) => {
                    self.mode = InputMode::Shell;
                    self.status = format!("Opening shell in {}", pod.name);
                    AppCommand::OpenShell(pod.uid.clone())
                }
                None => AppCommand::None,
            },
            Action::CloseShell => match visible.focused_session {
                Some(session) => AppCommand::CloseShell(session),
                None => {
                    self.status = "No shell open".to_string();
                    AppCommand::None
                }
            },
            Action::NextShell => self.cycle_shell(1, visible),
            Action::PrevShell => self.cycle_shell(-1, visible),
            Action::EnterShell => {
                if visible.focused_session.is_some() {
                    self.mode = InputMode::Shell;
                    self.status = "Shell focused, Ctrl+] returns".to_string();
                } else {
                    self.status = "No shell open, press s on a pod".to_string();
                }
                AppCommand::None
            }
            Action::LeaveShell => {
                self.mode = InputMode::Normal;
                AppCommand::None
            }
            Action::ShellInput(bytes) => match visible.focused_session {
                Some(session) => AppCommand::SendToShell { session, bytes },
                None => {
                    self.mode = InputMode::Normal;
                    AppCommand::None
                }
            },
            Action::StartNamespace => {
                self.mode = InputMode::Namespace;
                self.namespace_input.clear();
                AppCommand::None
            }
            Action::ClearStatus => {
                self.status.clear();
                AppCommand::ClearStatus
            }
            Action::SubmitInput => {
                self.mode = InputMode::Normal;
                let namespace = self.namespace_input.trim().to_string();
                self.namespace_input.clear();
                if namespace.is_empty() {
                    self.status = "Namespace unchanged".to_string();
                    return AppCommand::None;
                }
                self.cursor = 0;
                self.status = format!("Namespace: {namespace}");
                AppCommand::SwitchNamespace(namespace)
            }
            Action::CancelInput => {
                self.mode = InputMode::Normal;
                self.namespace_input.clear();
                AppCommand::None
            }
            Action::Backspace => {
                self.namespace_input.pop();
                AppCommand::None
            }
            Action::InputChar(c) => {
                if !c.is_whitespace() {
                    self.namespace_input.push(c);
                }
                AppCommand::None
            }
        }
    }

    fn move_cursor(&mut self, delta: isize, visible: Visible<'_>) -> AppCommand {
        let len = visible.pods.len();
        if len == 0 {
            self.cursor = 0;
            return AppCommand::None;
        }
        let max_index = len.saturating_sub(1) as isize;
        let current = self.cursor.min(max_index as usize) as isize;
        self.cursor = current.saturating_add(delta).clamp(0, max_index) as usize;
        AppCommand::None
    }

    fn cycle_shell(&mut self, delta: isize, visible: Visible<'_>) -> AppCommand {
        if visible.sessions.is_empty() {
            return AppCommand::None;
        }
        let len = visible.sessions.len() as isize;
        let current = visible
            .focused_session
            .and_then(|focused| visible.sessions.iter().position(|id| *id == focused))
            .map(|index| index as isize)
            .unwrap_or(-1);
        let next = (current + delta).rem_euclid(len) as usize;
        AppCommand::FocusShell(visible.sessions[next])
    }

    fn pod_at_cursor<'a>(&self, visible: Visible<'a>) -> Option<&'a PodRecord> {
        visible.pods.get(self.cursor.min(visible.pods.len().saturating_sub(1)))
    }

    pub fn shell_closed(&mut self, remaining: usize) {
        if remaining == 0 && self.mode == InputMode::Shell {
            self.mode = InputMode::Normal;
        }
    }

    pub fn selected_index(&self, len: usize) -> Option<usize> {
        (len > 0).then(|| self.cursor.min(len - 1))
    }

    pub fn set_page_size(&mut self, rows: usize) {
        self.page_size = rows.max(1);
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn namespace_input(&self) -> &str {
        &self.namespace_input
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn context(&self) -> &str {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::{App, AppCommand, InputMode, Visible};
    use crate::input::Action;
    use crate::model::fixtures::pod;
    use crate::model::PodRecord;

    fn app() -> App {
        App::new("https://cluster".to_string(), "kind".to_string())
    }

    fn pods() -> Vec<PodRecord> {
        vec![
            pod("u1", "api", "Running", &["app"]),
            pod("u2", "worker", "Running", &["app"]),
            pod("u3", "db", "Pending", &["db"]),
        ]
    }

    fn visible<'a>(
        pods: &'a [PodRecord],
        sessions: &'a [u64],
        focused: Option<u64>,
    ) -> Visible<'a> {
        Visible {
            pods,
            sessions,
            focused_session: focused,
        }
    }

    #[test]
    fn cursor_moves_and_clamps() {
        let pods = pods();
        let mut app = app();
        let view = visible(&pods, &[], None);

        app.apply_action(Action::Up, view);
        assert_eq!(app.selected_index(pods.len()), Some(0));
        app.apply_action(Action::Bottom, view);
        assert_eq!(app.selected_index(pods.len()), Some(2));
        app.apply_action(Action::Down, view);
        assert_eq!(app.selected_index(pods.len()), Some(2));
        app.apply_action(Action::GPrefix, view);
        app.apply_action(Action::GPrefix, view);
        assert_eq!(app.selected_index(pods.len()), Some(0));
        assert_eq!(app.selected_index(0), None);
    }

    #[test]
    fn enter_selects_pod_under_cursor() {
        let pods = pods();
        let mut app = app();
        let view = visible(&pods, &[], None);
        app.apply_action(Action::Down, view);

        assert_eq!(
            app.apply_action(Action::SelectPod, view),
            AppCommand::SelectPod("u2".to_string())
        );
        assert_eq!(app.apply_action(Action::SelectPod, visible(&[], &[], None)), AppCommand::None);
    }

    #[test]
    fn namespace_prompt_submits_trimmed_name() {
        let pods = pods();
        let mut app = app();
        let view = visible(&pods, &[], None);
        app.apply_action(Action::Bottom, view);

        app.apply_action(Action::StartNamespace, view);
        assert_eq!(app.mode(), InputMode::Namespace);
        for c in "kube-systemx".chars() {
            app.apply_action(Action::InputChar(c), view);
        }
        app.apply_action(Action::Backspace, view);

        assert_eq!(
            app.apply_action(Action::SubmitInput, view),
            AppCommand::SwitchNamespace("kube-system".to_string())
        );
        assert_eq!(app.mode(), InputMode::Normal);
        assert_eq!(app.selected_index(pods.len()), Some(0));

        app.apply_action(Action::StartNamespace, view);
        assert_eq!(app.apply_action(Action::SubmitInput, view), AppCommand::None);
    }

    #[test]
    fn shell_focus_and_input_routing() {
        let pods = pods();
        let mut app = app();

        assert_eq!(
            app.apply_action(Action::OpenShell, visible(&pods, &[], None)),
            AppCommand::OpenShell("u1".to_string())
        );
        assert_eq!(app.mode(), InputMode::Shell);

        let view = visible(&pods, &[4, 7], Some(4));
        assert_eq!(
            app.apply_action(Action::ShellInput(b"ls\r".to_vec()), view),
            AppCommand::SendToShell {
                session: 4,
                bytes: b"ls\r".to_vec()
            }
        );
        app.apply_action(Action::LeaveShell, view);
        assert_eq!(app.mode(), InputMode::Normal);

        assert_eq!(app.apply_action(Action::NextShell, view), AppCommand::FocusShell(7));
        assert_eq!(
            app.apply_action(Action::PrevShell, visible(&pods, &[4, 7], Some(4))),
            AppCommand::FocusShell(7)
        );
        assert_eq!(app.apply_action(Action::CloseShell, view), AppCommand::CloseShell(4));
    }

    #[test]
    fn closing_the_last_shell_returns_to_normal_mode() {
        let mut app = app();
        app.apply_action(Action::EnterShell, visible(&[], &[1], Some(1)));
        assert_eq!(app.mode(), InputMode::Shell);
        app.shell_closed(0);
        assert_eq!(app.mode(), InputMode::Normal);
    }

    #[test]
    fn help_swallows_next_key() {
        let pods = pods();
        let mut app = app();
        let view = visible(&pods, &[], None);
        app.apply_action(Action::ToggleHelp, view);
        assert!(app.show_help());
        assert_eq!(app.apply_action(Action::SelectPod, view), AppCommand::None);
        assert!(!app.show_help());
    }
}
