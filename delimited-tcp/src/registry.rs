use std::{fmt, sync::Arc};

/// Called with each message delivered or sent.
pub type Observer = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Receive and send observers, invoked in registration order.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    on_receive: Vec<Observer>,
    on_send: Vec<Observer>,
}

impl CallbackRegistry {
    pub fn add_on_receive(&mut self, observer: Observer) {
        self.on_receive.push(observer);
    }

    pub fn add_on_send(&mut self, observer: Observer) {
        self.on_send.push(observer);
    }

    pub fn notify_receive(&self, message: &str) {
        for observer in &self.on_receive {
            observer(message);
        }
    }

    pub fn notify_send(&self, message: &str) {
        for observer in &self.on_send {
            observer(message);
        }
    }

    pub fn receive_observers(&self) -> usize {
        self.on_receive.len()
    }

    pub fn send_observers(&self) -> usize {
        self.on_send.len()
    }

    pub(crate) fn register(&mut self, registration: Registration) {
        match registration {
            Registration::Receive(observer) => self.add_on_receive(observer),
            Registration::Send(observer) => self.add_on_send(observer),
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("on_receive", &self.on_receive.len())
            .field("on_send", &self.on_send.len())
            .finish()
    }
}

/// An observer travelling to the worker that owns a registry.
#[derive(Clone)]
pub(crate) enum Registration {
    Receive(Observer),
    Send(Observer),
}
