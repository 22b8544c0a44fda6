use crossbeam::channel::{bounded, Receiver, Sender};

/// A request to be told once an epoch has been passed
#[derive(Debug)]
pub(crate) struct EpochWatcher {
    pub epoch: u64,
    notify: Sender<()>,
}

impl EpochWatcher {
    /// A watcher for anything newer than `epoch`, and the receiving end of
    /// its notification
    pub fn new(epoch: u64) -> (Self, Receiver<()>) {
        let (notify, rx) = bounded(1);
        (Self { epoch, notify }, rx)
    }
}

/// Notify and drop every watcher whose epoch is older than `epoch`
pub(crate) fn notify_satisfied(watchers: &mut Vec<EpochWatcher>, epoch: u64) {
    watchers.retain(|w| {
        if w.epoch < epoch {
            let _ = w.notify.try_send(());
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_passed_watchers_fire() {
        let (a, a_rx) = EpochWatcher::new(3);
        let (b, b_rx) = EpochWatcher::new(5);
        let mut watchers = vec![a, b];

        notify_satisfied(&mut watchers, 4);
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
        assert_eq!(watchers.len(), 1);

        notify_satisfied(&mut watchers, 5);
        assert_eq!(watchers.len(), 1);
        notify_satisfied(&mut watchers, 6);
        assert!(b_rx.try_recv().is_ok());
        assert!(watchers.is_empty());
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (a, a_rx) = EpochWatcher::new(1);
        drop(a_rx);
        let mut watchers = vec![a];
        notify_satisfied(&mut watchers, 2);
        assert!(watchers.is_empty());
    }
}
