//! A task with a side channel of progress updates.

use std::future::Future;

use tokio::sync::mpsc;

/// Drives `task` to completion, handing every update received on `updates`
/// to `on_update` while it runs.
///
/// Updates are preferred over completion, and the mailbox is drained after
/// the task finishes, so no update sent before completion is lost. Each
/// update is fully handled before the next is taken.
pub async fn supervise<T, U, F, HF>(
    task: impl Future<Output = T>,
    updates: &mut mpsc::UnboundedReceiver<U>,
    mut on_update: F,
) -> T
where
    F: FnMut(U) -> HF,
    HF: Future<Output = ()>,
{
    tokio::pin!(task);
    let mut updates_open = true;

    let output = loop {
        tokio::select! {
            biased;

            update = updates.recv(), if updates_open => match update {
                Some(update) => on_update(update).await,
                None => updates_open = false,
            },
            output = &mut task => break output,
        }
    };

    while let Ok(update) = updates.try_recv() {
        on_update(update).await;
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn updates_sent_right_before_completion_are_delivered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = async move {
            for i in 0..5 {
                tx.send(i).unwrap();
            }
            "done"
        };
        let seen_clone = seen.clone();
        let output = supervise(task, &mut rx, |u| {
            let seen = seen_clone.clone();
            async move { seen.lock().unwrap().push(u) }
        })
        .await;

        assert_eq!(output, "done");
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn updates_are_handled_while_task_is_still_running() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_task = seen.clone();

        let task = async move {
            tx.send("plan").unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            // The first update was handled before we finished.
            let handled = seen_in_task.lock().unwrap().len();
            tx.send("apply").unwrap();
            handled
        };
        let seen_clone = seen.clone();
        let handled_midway = supervise(task, &mut rx, |u| {
            let seen = seen_clone.clone();
            async move { seen.lock().unwrap().push(u) }
        })
        .await;

        assert_eq!(handled_midway, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["plan", "apply"]);
    }

    #[tokio::test]
    async fn closed_mailbox_still_waits_for_task() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        drop(tx);

        let output = supervise(async { 7 }, &mut rx, |_| async {}).await;
        assert_eq!(output, 7);
    }
}
