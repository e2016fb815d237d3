use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::DetailView;
use crate::core::images::{DecodedImage, ImageEvent, ImageLoader};
use crate::core::models::InboxMessage;
use crate::core::store::NotFound;
use crate::core::sync::{InboxSyncEngine, SyncError};

#[derive(Debug, Clone, PartialEq)]
pub enum IconState {
    /// The message has no icon.
    None,
    Loading,
    Loaded(Arc<DecodedImage>),
    /// Fetch or decode failed; draw the generic icon.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetailState {
    Empty,
    Showing {
        message: InboxMessage,
        icon: IconState,
    },
    /// The message vanished from the store before it could be shown.
    Unavailable { id: String },
}

impl DetailState {
    pub const UNAVAILABLE_TEXT: &'static str = "message no longer available";
}

#[derive(Debug)]
pub enum DetailEvent {
    /// Tagged with the activation that subscribed, so late events from a
    /// previous message are dropped.
    Icon { activation: u64, event: ImageEvent },
    /// Outcome of re-fetching the shown message. `None` means it left the
    /// store meanwhile.
    Refreshed {
        activation: u64,
        result: Result<Option<InboxMessage>, SyncError>,
    },
}

pub struct InboxDetailPresenter<V> {
    engine: InboxSyncEngine,
    images: ImageLoader,
    view: V,
    state: DetailState,
    events: mpsc::UnboundedSender<DetailEvent>,
    activation: u64,
    icon_task: Option<JoinHandle<()>>,
}

impl<V: DetailView> InboxDetailPresenter<V> {
    pub fn new(
        engine: InboxSyncEngine,
        images: ImageLoader,
        view: V,
    ) -> (Self, mpsc::UnboundedReceiver<DetailEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let presenter = InboxDetailPresenter {
            engine,
            images,
            view,
            state: DetailState::Empty,
            events,
            activation: 0,
            icon_task: None,
        };
        (presenter, rx)
    }

    pub fn state(&self) -> &DetailState {
        &self.state
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn activate(&mut self, id: &str) {
        self.deactivate();
        self.activation += 1;

        let message = match self.engine.store().get(id) {
            Ok(message) => message,
            Err(NotFound(id)) => {
                log::debug!("Detail for {} unavailable", id);
                self.show_unavailable(id);
                return;
            }
        };

        // A sync may have removed it between the two calls.
        if let Err(NotFound(id)) = self.engine.mark_read(id) {
            self.show_unavailable(id);
            return;
        }

        let icon = match message.icon_url.clone() {
            Some(url) => {
                self.subscribe_icon(url);
                IconState::Loading
            }
            None => IconState::None,
        };
        self.state = DetailState::Showing {
            message: InboxMessage {
                is_read: true,
                ..message
            },
            icon,
        };
        self.render();
        self.spawn_refresh(id.to_string());
    }

    pub fn handle(&mut self, event: DetailEvent) {
        match event {
            DetailEvent::Icon { activation, event } => {
                if activation != self.activation {
                    return;
                }
                let DetailState::Showing { icon, message } = &mut self.state else {
                    return;
                };
                *icon = match event {
                    ImageEvent::Loading => IconState::Loading,
                    ImageEvent::Loaded(image) => IconState::Loaded(image),
                    ImageEvent::Failed(e) => {
                        log::debug!("Icon for {} failed: {}", message.id, e);
                        IconState::Placeholder
                    }
                };
            }
            DetailEvent::Refreshed { activation, result } => {
                if activation != self.activation {
                    return;
                }
                match result {
                    Ok(Some(fresh)) => self.apply_refresh(fresh),
                    Ok(None) => log::debug!("Shown message left the inbox"),
                    Err(e) => log::debug!("Message refresh failed: {}", e),
                }
            }
        }
        self.render();
    }

    /// Leave the detail view: stop any icon load it started.
    pub fn deactivate(&mut self) {
        if let Some(task) = self.icon_task.take() {
            task.abort();
        }
    }

    pub fn render(&mut self) {
        self.view.render(&self.state);
    }

    fn show_unavailable(&mut self, id: String) {
        self.state = DetailState::Unavailable { id };
        self.render();
    }

    fn apply_refresh(&mut self, fresh: InboxMessage) {
        let DetailState::Showing { message, .. } = &self.state else {
            return;
        };
        if message.id != fresh.id {
            return;
        }
        let icon_changed = message.icon_url != fresh.icon_url;
        let new_icon = fresh.icon_url.clone();

        if icon_changed {
            self.deactivate();
        }
        if let DetailState::Showing { message, icon } = &mut self.state {
            *message = fresh;
            if icon_changed {
                *icon = if new_icon.is_some() {
                    IconState::Loading
                } else {
                    IconState::None
                };
            }
        }
        if let (true, Some(url)) = (icon_changed, new_icon) {
            self.subscribe_icon(url);
        }
    }

    fn spawn_refresh(&self, id: String) {
        let engine = self.engine.clone();
        let events = self.events.clone();
        let activation = self.activation;
        tokio::spawn(async move {
            let result = engine.refresh_message(&id).await;
            let _ = events.send(DetailEvent::Refreshed { activation, result });
        });
    }

    fn subscribe_icon(&mut self, url: url::Url) {
        let mut subscription = self.images.load(url);
        let events = self.events.clone();
        let activation = self.activation;
        self.icon_task = Some(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if events.send(DetailEvent::Icon { activation, event }).is_err() {
                    break;
                }
            }
        }));
    }
}

impl<V> Drop for InboxDetailPresenter<V> {
    fn drop(&mut self) {
        if let Some(task) = self.icon_task.take() {
            task.abort();
        }
    }
}
