use tokio::sync::watch;

/// How far an operator-initiated shutdown has progressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    /// New transfers are accepted.
    Running,
    /// No new transfers; live ones run to completion.
    Draining,
    /// Live transfers are cancelled too.
    Aborted,
}

/// The owning half of the shutdown token. Listeners are handed to the accept loop and to every
/// session when it is created.
#[derive(Debug)]
pub struct Shutdown {
    state_sx: watch::Sender<ShutdownState>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (state_sx, _) = watch::channel(ShutdownState::Running);
        Shutdown { state_sx }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            state_rx: self.state_sx.subscribe(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state_sx.borrow()
    }

    pub fn drain(&self) {
        self.state_sx.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
    }

    pub fn abort(&self) {
        self.state_sx.send_replace(ShutdownState::Aborted);
    }

    /// Moves one step further along running -> draining -> aborted and returns the new state.
    pub fn escalate(&self) -> ShutdownState {
        match self.state() {
            ShutdownState::Running => self.drain(),
            _ => self.abort(),
        }
        self.state()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownListener {
    state_rx: watch::Receiver<ShutdownState>,
}

impl ShutdownListener {
    /// A listener that never fires, for callers that do not take part in a shutdown.
    pub fn detached() -> ShutdownListener {
        Shutdown::new().listener()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state_rx.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Resolves once live transfers should be cancelled. If the owning `Shutdown` is gone without
    /// aborting, this never resolves.
    pub async fn aborted(&mut self) {
        if self
            .state_rx
            .wait_for(|state| *state == ShutdownState::Aborted)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }
}
