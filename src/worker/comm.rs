//! Process transport: broadcast, gather and barrier between ranks.
//!
//! Epistemic foundation:
//! - K_i: Rank 0 is the controller; every collective is rooted there
//! - K_i: Messages from one source on one channel arrive in send order
//! - B_i: A peer may hang up → Comm error
//! - I^R: How ranks are connected (one process, threads, a cluster) is the
//!   implementor's concern

use crate::models::{HistMatchError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Rank of the controller.
pub const CONTROLLER: usize = 0;

/// Logical channel; worker-mode control traffic never mixes with data collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Data,
    Control,
}

/// Collective operations between ranks.
pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Broadcast from the controller. `value` is ignored on workers.
    fn bcast(&self, channel: Channel, value: Value) -> Result<Value>;

    /// Gather to the controller in rank order; workers get `None`.
    fn gather(&self, channel: Channel, value: Value) -> Result<Option<Vec<Value>>>;

    fn barrier(&self) -> Result<()> {
        self.gather(Channel::Data, Value::Null)?;
        self.bcast(Channel::Data, Value::Null)?;
        Ok(())
    }

    fn is_controller(&self) -> bool {
        self.rank() == CONTROLLER
    }
}

/// Single-process communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComm;

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        CONTROLLER
    }

    fn size(&self) -> usize {
        1
    }

    fn bcast(&self, _channel: Channel, value: Value) -> Result<Value> {
        Ok(value)
    }

    fn gather(&self, _channel: Channel, value: Value) -> Result<Option<Vec<Value>>> {
        Ok(Some(vec![value]))
    }
}

#[derive(Debug)]
struct Envelope {
    src: usize,
    channel: Channel,
    payload: Value,
}

/// One endpoint of an in-process group of ranks, one thread per rank.
pub struct ThreadComm {
    rank: usize,
    size: usize,
    /// Sender per destination; `None` for this rank
    senders: Vec<Option<UnboundedSender<Envelope>>>,
    receiver: Mutex<UnboundedReceiver<Envelope>>,
    /// Messages that arrived while waiting for another (source, channel)
    pending: Mutex<HashMap<(usize, Channel), VecDeque<Value>>>,
}

impl ThreadComm {
    /// Create `n` connected endpoints; endpoint `i` has rank `i`.
    pub fn group(n: usize) -> Vec<ThreadComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| unbounded_channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ThreadComm {
                rank,
                size: n,
                senders: senders
                    .iter()
                    .enumerate()
                    .map(|(dest, s)| (dest != rank).then(|| s.clone()))
                    .collect(),
                receiver: Mutex::new(receiver),
                pending: Mutex::new(HashMap::new()),
            })
            .collect()
    }

    fn send(&self, dest: usize, channel: Channel, payload: Value) -> Result<()> {
        let sender = self
            .senders
            .get(dest)
            .and_then(Option::as_ref)
            .ok_or_else(|| HistMatchError::Comm(format!("rank {} cannot send to {dest}", self.rank)))?;
        sender
            .send(Envelope {
                src: self.rank,
                channel,
                payload,
            })
            .map_err(|_| HistMatchError::Comm(format!("rank {dest} hung up")))
    }

    fn recv(&self, src: usize, channel: Channel) -> Result<Value> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| HistMatchError::Comm("pending buffer poisoned".to_string()))?;
        if let Some(v) = pending.get_mut(&(src, channel)).and_then(VecDeque::pop_front) {
            return Ok(v);
        }
        let mut receiver = self
            .receiver
            .lock()
            .map_err(|_| HistMatchError::Comm("receiver poisoned".to_string()))?;
        loop {
            let envelope = receiver.blocking_recv().ok_or_else(|| {
                HistMatchError::Comm(format!("rank {} lost every peer", self.rank))
            })?;
            if envelope.src == src && envelope.channel == channel {
                return Ok(envelope.payload);
            }
            pending
                .entry((envelope.src, envelope.channel))
                .or_default()
                .push_back(envelope.payload);
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn bcast(&self, channel: Channel, value: Value) -> Result<Value> {
        if self.rank == CONTROLLER {
            for dest in 1..self.size {
                self.send(dest, channel, value.clone())?;
            }
            Ok(value)
        } else {
            self.recv(CONTROLLER, channel)
        }
    }

    fn gather(&self, channel: Channel, value: Value) -> Result<Option<Vec<Value>>> {
        if self.rank == CONTROLLER {
            let mut all = Vec::with_capacity(self.size);
            all.push(value);
            for src in 1..self.size {
                all.push(self.recv(src, channel)?);
            }
            Ok(Some(all))
        } else {
            self.send(CONTROLLER, channel, value)?;
            Ok(None)
        }
    }
}

/// Controller-computed result as seen by every rank.
#[derive(Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
enum Shared<T> {
    Ok(T),
    Err(String),
}

fn encode<T: Serialize>(shared: &Shared<T>) -> Result<Value> {
    serde_json::to_value(shared)
        .map_err(|e| HistMatchError::Internal(format!("encoding shared value: {e}")))
}

/// Share a controller-only result with every rank.
///
/// The controller passes `Some(result)`, workers pass `None`. A controller
/// failure is returned unchanged on the controller and as a `Remote` error on
/// every worker, so no rank is left waiting.
pub fn share<T: Serialize + DeserializeOwned>(comm: &dyn Communicator, local: Option<Result<T>>) -> Result<T> {
    if comm.is_controller() {
        let local = local.unwrap_or_else(|| {
            Err(HistMatchError::Internal("controller has no value to share".to_string()))
        });
        if comm.size() == 1 {
            return local;
        }
        match local {
            Ok(v) => {
                comm.bcast(Channel::Data, encode(&Shared::Ok(&v))?)?;
                Ok(v)
            }
            Err(e) => {
                comm.bcast(Channel::Data, encode(&Shared::<()>::Err(e.to_string()))?)?;
                Err(e)
            }
        }
    } else {
        let value = comm.bcast(Channel::Data, Value::Null)?;
        match serde_json::from_value::<Shared<T>>(value)? {
            Shared::Ok(v) => Ok(v),
            Shared::Err(msg) => Err(HistMatchError::Remote(msg)),
        }
    }
}

/// Compute `f(i)` for `i in 0..n`, spread round-robin over the ranks.
///
/// Every rank gets the full result in index order, or the first error.
pub fn distribute<T, F>(comm: &dyn Communicator, n: usize, mut f: F) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(usize) -> Result<T>,
{
    let (rank, size) = (comm.rank(), comm.size());
    if size == 1 {
        return (0..n).map(f).collect();
    }

    let local: Result<Vec<(usize, T)>> = (rank..n).step_by(size).map(|i| Ok((i, f(i)?))).collect();
    let local = match local {
        Ok(items) => Shared::Ok(items),
        Err(e) => Shared::Err(e.to_string()),
    };
    let gathered = comm.gather(Channel::Data, encode(&local)?)?;

    let assembled = gathered.map(|parts| -> Result<Vec<T>> {
        let mut slots: Vec<Option<T>> = (0..n).map(|_| None).collect();
        for (src, part) in parts.into_iter().enumerate() {
            match serde_json::from_value::<Shared<Vec<(usize, T)>>>(part)? {
                Shared::Ok(items) => {
                    for (i, v) in items {
                        if let Some(slot) = slots.get_mut(i) {
                            *slot = Some(v);
                        }
                    }
                }
                Shared::Err(msg) if src == CONTROLLER => return Err(HistMatchError::Remote(msg)),
                Shared::Err(msg) => {
                    return Err(HistMatchError::Remote(format!("rank {src}: {msg}")))
                }
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| HistMatchError::Internal(format!("item {i} was not computed"))))
            .collect()
    });
    share(comm, assembled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn test_local_comm_is_identity() {
        let comm = LocalComm;
        assert!(comm.is_controller());
        assert_eq!(comm.bcast(Channel::Data, json!(3)).unwrap(), json!(3));
        assert_eq!(comm.gather(Channel::Data, json!(1)).unwrap(), Some(vec![json!(1)]));
        let doubled = distribute(&comm, 4, |i| Ok(i * 2)).unwrap();
        assert_eq!(doubled, vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_channels_do_not_mix() {
        let handles: Vec<_> = ThreadComm::group(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let control = comm.bcast(Channel::Control, json!("ctl")).unwrap();
                    let data = comm.bcast(Channel::Data, json!("data")).unwrap();
                    // Workers read the data message first even though control was sent first
                    (data, control)
                })
            })
            .collect();
        for h in handles {
            let (data, control) = h.join().unwrap();
            assert_eq!(data, json!("data"));
            assert_eq!(control, json!("ctl"));
        }
    }

    #[test]
    fn test_distribute_and_share_across_ranks() {
        let handles: Vec<_> = ThreadComm::group(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let squares = distribute(&comm, 7, |i| Ok(i * i)).unwrap();
                    let local = comm
                        .is_controller()
                        .then(|| Err::<usize, _>(HistMatchError::Request("nope".to_string())));
                    let shared = share(&comm, local);
                    comm.barrier().unwrap();
                    (comm.rank(), squares, shared)
                })
            })
            .collect();
        for h in handles {
            let (rank, squares, shared) = h.join().unwrap();
            assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36]);
            match (rank, shared) {
                (0, Err(HistMatchError::Request(_))) => {}
                (_, Err(HistMatchError::Remote(msg))) => assert!(msg.contains("nope")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
