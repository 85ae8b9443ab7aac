//! Chain Event Demultiplexer (spec §4.4 "event streaming", §9 "arena + index
//! for the active-subscription map"): routes `Initialize`/`Claim`/`Refund`
//! events emitted by a [`crate::chain::adapter::ChainAdapter`] to whichever
//! swap handler is waiting on that `(paymentHash, sequence)`.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::types::{ChainId, PaymentHash, Sequence};

/// A commitment-lifecycle event observed on a smart-contract chain.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Initialize {
        chain_id: ChainId,
        payment_hash: PaymentHash,
        sequence: Sequence,
        tx_id: String,
    },
    Claim {
        chain_id: ChainId,
        payment_hash: PaymentHash,
        sequence: Sequence,
        tx_id: String,
        witness: Vec<u8>,
    },
    Refund {
        chain_id: ChainId,
        payment_hash: PaymentHash,
        sequence: Sequence,
        tx_id: String,
    },
}

impl ChainEvent {
    pub fn key(&self) -> (PaymentHash, Sequence) {
        match self {
            ChainEvent::Initialize {
                payment_hash,
                sequence,
                ..
            }
            | ChainEvent::Claim {
                payment_hash,
                sequence,
                ..
            }
            | ChainEvent::Refund {
                payment_hash,
                sequence,
                ..
            } => (*payment_hash, *sequence),
        }
    }
}

/// Implemented by a swap handler so it can be registered with the demux.
/// Handlers register only for the duration of their own lifetime -- the
/// demux holds a [`Weak`] reference, so a handler that's been dropped
/// (swap finished and evicted from the store) is silently skipped rather
/// than kept alive or causing a dispatch error (spec §9: no handler
/// singletons, event routing must not pin memory).
pub trait SwapEventSink: Send + Sync {
    fn on_chain_event(&self, event: ChainEvent);
}

/// Subscription index mapping `(paymentHash, sequence)` to the handler
/// currently interested in that swap's chain events.
#[derive(Default)]
pub struct ChainEventDemux {
    subscribers: DashMap<(PaymentHash, Sequence), Weak<dyn SwapEventSink>>,
}

impl ChainEventDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` for events keyed by `(payment_hash, sequence)`,
    /// replacing any previous registration for that key.
    pub fn subscribe(
        &self,
        payment_hash: PaymentHash,
        sequence: Sequence,
        sink: &Arc<dyn SwapEventSink>,
    ) {
        self.subscribers
            .insert((payment_hash, sequence), Arc::downgrade(sink));
    }

    pub fn unsubscribe(&self, payment_hash: PaymentHash, sequence: Sequence) {
        self.subscribers.remove(&(payment_hash, sequence));
    }

    /// Routes `event` to its subscriber, if one is both registered and
    /// still alive. Returns `true` if delivered.
    pub fn dispatch(&self, event: ChainEvent) -> bool {
        let key = event.key();
        let Some(entry) = self.subscribers.get(&key) else {
            return false;
        };
        match entry.upgrade() {
            Some(sink) => {
                sink.on_chain_event(event);
                true
            }
            None => {
                drop(entry);
                self.subscribers.remove(&key);
                false
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    impl SwapEventSink for CountingSink {
        fn on_chain_event(&self, _event: ChainEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key(n: u8) -> (PaymentHash, Sequence) {
        (PaymentHash([n; 32]), Sequence(n as u64))
    }

    #[test]
    fn dispatches_to_registered_live_sink() {
        let demux = ChainEventDemux::new();
        let sink: Arc<dyn SwapEventSink> = Arc::new(CountingSink(AtomicUsize::new(0)));
        let (ph, seq) = key(1);
        demux.subscribe(ph, seq, &sink);

        let delivered = demux.dispatch(ChainEvent::Claim {
            chain_id: ChainId("evm:1".into()),
            payment_hash: ph,
            sequence: seq,
            tx_id: "0xabc".into(),
            witness: vec![],
        });
        assert!(delivered);
        assert_eq!(demux.active_count(), 1);
    }

    #[test]
    fn drops_dead_sink_on_dispatch() {
        let demux = ChainEventDemux::new();
        let (ph, seq) = key(2);
        {
            let sink: Arc<dyn SwapEventSink> = Arc::new(CountingSink(AtomicUsize::new(0)));
            demux.subscribe(ph, seq, &sink);
        } // sink dropped here; demux only holds a Weak

        let delivered = demux.dispatch(ChainEvent::Refund {
            chain_id: ChainId("evm:1".into()),
            payment_hash: ph,
            sequence: seq,
            tx_id: "0xdef".into(),
        });
        assert!(!delivered);
        assert_eq!(demux.active_count(), 0);
    }

    #[test]
    fn unregistered_key_is_not_delivered() {
        let demux = ChainEventDemux::new();
        let (ph, seq) = key(3);
        let delivered = demux.dispatch(ChainEvent::Initialize {
            chain_id: ChainId("evm:1".into()),
            payment_hash: ph,
            sequence: seq,
            tx_id: "0x1".into(),
        });
        assert!(!delivered);
    }
}
