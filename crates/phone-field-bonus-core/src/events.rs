use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{debounce_key, AwardGuard, BonusError, BonusSettings, GuardOutcome, JobQueue, UserId};

const DEBOUNCE_VALUE: &str = "1";

/// Host lifecycle events that may mean the phone field changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    UserUpdated,
    UserCustomFieldsUpdated,
    UserProfileUpdated,
    UserFieldUpdated,
}

impl TriggerKind {
    pub const ALL: [Self; 4] = [
        Self::UserUpdated,
        Self::UserCustomFieldsUpdated,
        Self::UserProfileUpdated,
        Self::UserFieldUpdated,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserUpdated => "user_updated",
            Self::UserCustomFieldsUpdated => "user_custom_fields_updated",
            Self::UserProfileUpdated => "user_profile_updated",
            Self::UserFieldUpdated => "user_field_updated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user_updated" => Some(Self::UserUpdated),
            "user_custom_fields_updated" => Some(Self::UserCustomFieldsUpdated),
            "user_profile_updated" => Some(Self::UserProfileUpdated),
            "user_field_updated" => Some(Self::UserFieldUpdated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub user_id: Option<UserId>,
}

impl TriggerEvent {
    #[must_use]
    pub fn new(kind: TriggerKind, user_id: UserId) -> Self {
        Self {
            kind,
            user_id: Some(user_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "dispatch", content = "detail", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Disabled,
    InvalidInput,
    Queued { job_id: u64 },
    Debounced,
    Checked(GuardOutcome),
    Failed(String),
}

pub trait TriggerHandler: Send + Sync {
    fn handle(&self, event: &TriggerEvent) -> DispatchOutcome;
}

/// Routes trigger events to the handlers subscribed to their kind.
#[derive(Default)]
pub struct EventRegistry {
    handlers: BTreeMap<TriggerKind, Vec<Arc<dyn TriggerHandler>>>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: TriggerKind, handler: Arc<dyn TriggerHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn subscribe_all(&mut self, handler: Arc<dyn TriggerHandler>) {
        for kind in TriggerKind::ALL {
            self.subscribe(kind, handler.clone());
        }
    }

    #[must_use]
    pub fn handler_count(&self, kind: TriggerKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Runs every handler for `event.kind` in subscription order.
    pub fn publish(&self, event: &TriggerEvent) -> Vec<DispatchOutcome> {
        self.handlers
            .get(&event.kind)
            .map(|handlers| handlers.iter().map(|handler| handler.handle(event)).collect())
            .unwrap_or_default()
    }
}

/// Trigger handler that runs the award guard inline, or debounces and
/// enqueues an award job when asynchronous awards are enabled.
pub struct BonusDispatcher {
    guard: Arc<AwardGuard>,
    queue: Option<Arc<dyn JobQueue>>,
}

impl BonusDispatcher {
    #[must_use]
    pub fn new(guard: Arc<AwardGuard>) -> Self {
        Self { guard, queue: None }
    }

    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    fn enqueue(
        &self,
        queue: &dyn JobQueue,
        settings: &BonusSettings,
        user_id: UserId,
    ) -> Result<DispatchOutcome, BonusError> {
        let fresh = self
            .guard
            .kv
            .set_if_absent(
                &debounce_key(user_id),
                DEBOUNCE_VALUE,
                settings.debounce_window(),
            )
            .map_err(|err| BonusError::transient(&err))?;
        if !fresh {
            debug!(user_id = user_id.0, "award job already scheduled within debounce window");
            return Ok(DispatchOutcome::Debounced);
        }

        let job_id = queue
            .enqueue(user_id, settings.job_delay())
            .map_err(|err| BonusError::transient(&err))?;
        debug!(user_id = user_id.0, job_id, "enqueued phone field bonus job");
        Ok(DispatchOutcome::Queued { job_id })
    }
}

impl TriggerHandler for BonusDispatcher {
    fn handle(&self, event: &TriggerEvent) -> DispatchOutcome {
        let settings = match self.guard.load_settings() {
            Ok(settings) => settings,
            Err(err) => {
                warn!(trigger = event.kind.as_str(), error = %err, "cannot load phone field bonus settings");
                return DispatchOutcome::Failed(err.to_string());
            }
        };
        if !settings.enabled {
            return DispatchOutcome::Disabled;
        }

        let Some(user_id) = event.user_id.filter(|user_id| user_id.0 != 0) else {
            debug!(trigger = event.kind.as_str(), "trigger without user");
            return DispatchOutcome::InvalidInput;
        };

        let result = match (settings.async_awards, self.queue.as_deref()) {
            (true, Some(queue)) => self.enqueue(queue, &settings, user_id),
            _ => self
                .guard
                .check_user(user_id)
                .map(DispatchOutcome::Checked),
        };

        match result {
            Ok(outcome) => outcome,
            Err(BonusError::NotFound(user_id)) => {
                warn!(trigger = event.kind.as_str(), user_id = user_id.0, "trigger for unknown user");
                DispatchOutcome::InvalidInput
            }
            Err(err) => {
                warn!(
                    trigger = event.kind.as_str(),
                    user_id = user_id.0,
                    error = %err,
                    "phone field bonus check failed"
                );
                DispatchOutcome::Failed(err.to_string())
            }
        }
    }
}

/// Subscribes `dispatcher` to every trigger kind.
pub fn register_triggers(registry: &mut EventRegistry, dispatcher: Arc<BonusDispatcher>) {
    registry.subscribe_all(dispatcher);
}
