//!Routing for the physical buttons and joystick. The same five joystick
//!directions and three keys mean different things in different modes, so
//!each interaction context pushes its own set of handlers onto a stack and
//!only the top set fires. The push returns a guard that pops on drop, so no
//!exit path can leak a stale context onto the next one.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use raceway_core::{InputEvent, JoystickDirection};

pub type KeyHandler = Box<dyn Fn() + Send + Sync>;
pub type JoystickHandler = Box<dyn Fn(JoystickDirection) + Send + Sync>;

///Handlers for one interaction context: one procedure per key and one for
///the joystick as a whole.
pub struct HandlerSet {
    pub key_1: KeyHandler,
    pub key_2: KeyHandler,
    pub key_3: KeyHandler,
    pub joystick: JoystickHandler,
}

impl HandlerSet {
    ///Bottom-of-stack handlers that just report the press.
    pub fn default_handlers() -> Self {
        Self {
            key_1: Box::new(|| debug!("key 1 pressed, no handler installed")),
            key_2: Box::new(|| debug!("key 2 pressed, no handler installed")),
            key_3: Box::new(|| debug!("key 3 pressed, no handler installed")),
            joystick: Box::new(|dir| debug!("joystick {:?}, no handler installed", dir)),
        }
    }

    ///The race context: any key aborts the race in progress. The joystick
    ///does nothing until the session is back at the menu.
    pub fn race_abort(cancel: CancellationToken) -> Self {
        let for_key = |cancel: CancellationToken| {
            Box::new(move || {
                debug!("key pressed during race, aborting");
                cancel.cancel();
            }) as KeyHandler
        };
        Self {
            key_1: for_key(cancel.clone()),
            key_2: for_key(cancel.clone()),
            key_3: for_key(cancel),
            joystick: Box::new(|dir| debug!("joystick {:?} ignored during race", dir)),
        }
    }
}

///Stack of handler contexts. Entering a blocking interaction pushes a set,
///leaving it drops the guard and restores the previous context.
pub struct InputRouter {
    stack: Mutex<Vec<Arc<HandlerSet>>>,
}

impl InputRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stack: Mutex::new(vec![Arc::new(HandlerSet::default_handlers())]),
        })
    }

    #[must_use = "dropping the guard immediately pops the handlers again"]
    pub fn push(self: &Arc<Self>, handlers: HandlerSet) -> HandlerGuard {
        let mut stack = self.stack.lock().unwrap();
        stack.push(Arc::new(handlers));
        debug!("input context pushed, depth {}", stack.len());
        HandlerGuard {
            router: self.clone(),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().unwrap().len()
    }

    ///Fire the top-of-stack handler for one event. The handler runs outside
    ///the stack lock so it may push or pop contexts itself.
    pub fn dispatch(&self, event: InputEvent) {
        let top = {
            let stack = self.stack.lock().unwrap();
            match stack.last() {
                Some(top) => top.clone(),
                None => return,
            }
        };
        match event {
            InputEvent::Key1 => (top.key_1)(),
            InputEvent::Key2 => (top.key_2)(),
            InputEvent::Key3 => (top.key_3)(),
            InputEvent::Joystick(dir) => (top.joystick)(dir),
        }
    }

    ///Consume hardware events from `rx` until the channel closes.
    pub fn spawn_dispatcher(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<InputEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.dispatch(event);
            }
            debug!("input event channel closed");
        })
    }

    fn pop(&self) {
        let mut stack = self.stack.lock().unwrap();
        if stack.len() <= 1 {
            //the bottom default set is permanent
            warn!("input context pop with nothing pushed");
            return;
        }
        stack.pop();
        debug!("input context popped, depth {}", stack.len());
    }
}

///Scoped handle for a pushed handler context. Popping on drop guarantees
///the previous context is restored on every exit path, including aborts.
pub struct HandlerGuard {
    router: Arc<InputRouter>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.router.pop();
    }
}
