use crate::model::{
    Notification, NotificationBus, OperationKind, RecordRef, SubscriptionToken,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Raw record references observed while tracing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceLog {
    pub created: Vec<RecordRef>,
    pub destroyed: Vec<RecordRef>,
}

/// Records a create notification reports as newly inserted: still pending,
/// not destroyed, and of exactly the notified type.
pub fn qualifying_creates(notification: &Notification) -> Vec<RecordRef> {
    notification
        .transaction_records
        .iter()
        .filter(|tx| !tx.persisted && !tx.destroyed)
        .filter(|tx| tx.record.entity_type == notification.entity_type)
        .map(|tx| tx.record.clone())
        .collect()
}

pub fn destroyed_records(notification: &Notification) -> Vec<RecordRef> {
    notification
        .transaction_records
        .iter()
        .filter(|tx| tx.destroyed)
        .map(|tx| tx.record.clone())
        .collect()
}

/// Subscription scope. Listening stops on [`Tracer::stop`] or when dropped,
/// whichever comes first.
pub struct Tracer<'b> {
    bus: &'b dyn NotificationBus,
    tokens: Vec<SubscriptionToken>,
    log: Arc<Mutex<TraceLog>>,
}

impl<'b> Tracer<'b> {
    pub fn start(bus: &'b dyn NotificationBus) -> Self {
        let log = Arc::new(Mutex::new(TraceLog::default()));

        let created = Arc::clone(&log);
        let create_token = bus.subscribe(
            OperationKind::Create,
            Arc::new(move |notification: &Notification| {
                let refs = qualifying_creates(notification);
                lock(&created).created.extend(refs);
            }),
        );
        let destroyed = Arc::clone(&log);
        let destroy_token = bus.subscribe(
            OperationKind::Destroy,
            Arc::new(move |notification: &Notification| {
                let refs = destroyed_records(notification);
                lock(&destroyed).destroyed.extend(refs);
            }),
        );

        Self {
            bus,
            tokens: vec![create_token, destroy_token],
            log,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn stop(&mut self) {
        for token in self.tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
    }

    pub fn snapshot(&self) -> TraceLog {
        lock(&self.log).clone()
    }
}

impl Drop for Tracer<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(log: &Mutex<TraceLog>) -> MutexGuard<'_, TraceLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
