//! In-order work queue for the host device.
//!
//! Each stream owns a worker thread that executes submitted commands in
//! order. A failing command poisons the stream: later commands are skipped
//! until the fault is reported by the next [`Stream::sync`].

use std::any::Any;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use photon_core::DevicePtr;

use super::memory::HostMemory;
use crate::device::{ReleaseQueue, Stream};
use crate::error::{GpuError, Result};

/// A unit of device work executed on the stream worker.
pub type HostTask = Box<dyn FnOnce(&HostMemory) -> Result<()> + Send>;

/// Commands sent to the worker thread.
enum StreamCommand {
    /// Run a task against device memory.
    Execute(HostTask),
    /// Drop a resource once everything before it has run.
    Release(Box<dyn Any + Send>),
    /// Signal once everything before it has run.
    Fence(Sender<()>),
}

/// State shared between the stream handle and its worker.
struct StreamShared {
    /// First fault since the last sync.
    fault: Mutex<Option<GpuError>>,
}

/// In-order stream executing on a background thread.
pub struct HostStream {
    memory: Arc<HostMemory>,
    shared: Arc<StreamShared>,
    /// Only strong reference; release queues hold weak ones so a dropped
    /// stream still closes its channel.
    command_tx: Option<Arc<Sender<StreamCommand>>>,
    thread: Option<JoinHandle<()>>,
}

impl HostStream {
    /// Spawn a stream worker over `memory`.
    pub fn new(memory: Arc<HostMemory>) -> Result<Self> {
        let (command_tx, command_rx) = channel::unbounded::<StreamCommand>();
        let shared = Arc::new(StreamShared {
            fault: Mutex::new(None),
        });

        let worker_memory = Arc::clone(&memory);
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("photon-stream-{}", memory.device_id()))
            .spawn(move || Self::worker_loop(&worker_memory, &worker_shared, &command_rx))
            .map_err(|e| GpuError::Other(format!("Failed to spawn stream worker: {e}")))?;

        Ok(Self {
            memory,
            shared,
            command_tx: Some(Arc::new(command_tx)),
            thread: Some(thread),
        })
    }

    /// Main worker loop - blocks waiting for commands and runs them in order.
    fn worker_loop(memory: &HostMemory, shared: &StreamShared, command_rx: &Receiver<StreamCommand>) {
        while let Ok(command) = command_rx.recv() {
            match command {
                StreamCommand::Execute(task) => {
                    if shared.fault.lock().is_some() {
                        tracing::debug!("Skipping stream work after an earlier fault");
                        continue;
                    }
                    if let Err(e) = task(memory) {
                        tracing::error!("Stream work failed: {e}");
                        shared.fault.lock().get_or_insert(e);
                    }
                }
                StreamCommand::Release(resource) => drop(resource),
                StreamCommand::Fence(done) => {
                    // Waiter may have given up; nothing to report.
                    let _ = done.send(());
                }
            }
        }
    }

    fn send(&self, command: StreamCommand) -> Result<()> {
        self.command_tx
            .as_ref()
            .ok_or(GpuError::StreamClosed)?
            .send(command)
            .map_err(|_| GpuError::StreamClosed)
    }

    /// Enqueue a task that runs against device memory after all earlier work.
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&HostMemory) -> Result<()> + Send + 'static,
    {
        self.send(StreamCommand::Execute(Box::new(task)))
    }

    /// Memory this stream operates on.
    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }

    fn wait_idle(&self) -> Result<()> {
        let (done_tx, done_rx) = channel::bounded(1);
        self.send(StreamCommand::Fence(done_tx))?;
        done_rx.recv().map_err(|_| GpuError::StreamClosed)
    }
}

impl Stream for HostStream {
    fn device_id(&self) -> u32 {
        self.memory.device_id()
    }

    fn upload(&self, dst: DevicePtr, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.enqueue(move |memory| memory.write_bytes(dst, &data))
    }

    fn memset(&self, dst: DevicePtr, value: u8, size: u64) -> Result<()> {
        self.enqueue(move |memory| memory.fill(dst, value, size))
    }

    fn copy(&self, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<()> {
        self.enqueue(move |memory| memory.copy(dst, src, size))
    }

    fn download(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        self.sync()?;
        self.memory.read_bytes(src, dst)
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn sync(&self) -> Result<()> {
        self.wait_idle()?;
        match self.shared.fault.lock().take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn defer_release(&self, resource: Box<dyn Any + Send>) {
        // With the worker gone nothing is in flight, so the resource drops here.
        if self.send(StreamCommand::Release(resource)).is_err() {
            tracing::debug!("Released resource on a closed stream");
        }
    }

    fn release_queue(&self) -> ReleaseQueue {
        let command_tx = self.command_tx.as_ref().map_or_else(Weak::new, Arc::downgrade);
        ReleaseQueue::new(move |resource| {
            if let Some(tx) = command_tx.upgrade() {
                if tx.send(StreamCommand::Release(resource)).is_err() {
                    tracing::debug!("Released resource on a closed stream");
                }
            }
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.command_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StreamExt;

    #[test]
    fn work_runs_in_order() {
        let memory = Arc::new(HostMemory::new(0));
        let block = memory.allocate(4, "value").unwrap();
        let stream = HostStream::new(Arc::clone(&memory)).unwrap();
        stream.upload_slice(block.ptr, &[1u32]).unwrap();
        stream
            .enqueue(move |m| m.write(block.ptr, &(m.read::<u32>(block.ptr)? * 10)))
            .unwrap();
        stream.upload_slice(block.ptr, &[7u32]).unwrap();
        stream
            .enqueue(move |m| m.atomic_add_u32(block.ptr, 1).map(|_| ()))
            .unwrap();
        assert_eq!(stream.read_value::<u32>(block.ptr).unwrap(), 8);
    }

    #[test]
    fn fault_surfaces_at_sync_once() {
        let memory = Arc::new(HostMemory::new(0));
        let stream = HostStream::new(Arc::clone(&memory)).unwrap();
        stream.upload(DevicePtr(0x10), &[1, 2, 3]).unwrap();
        assert!(matches!(stream.sync(), Err(GpuError::InvalidAddress { .. })));
        assert!(stream.sync().is_ok());
    }

    #[test]
    fn deferred_release_waits_for_earlier_work() {
        let memory = Arc::new(HostMemory::new(0));
        let stream = HostStream::new(Arc::clone(&memory)).unwrap();
        let marker = Arc::new(());
        stream.defer_release(Box::new(Arc::clone(&marker)));
        stream.sync().unwrap();
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn release_queue_orders_behind_queued_work() {
        let memory = Arc::new(HostMemory::new(0));
        let block = memory.allocate(4, "gate").unwrap();
        let stream = HostStream::new(Arc::clone(&memory)).unwrap();
        let queue = stream.release_queue();
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        stream
            .enqueue(move |m| {
                let _ = gate_rx.recv();
                m.write(block.ptr, &1u32)
            })
            .unwrap();
        let marker = Arc::new(());
        queue.release(Box::new(Arc::clone(&marker)));
        assert_eq!(Arc::strong_count(&marker), 2);
        gate_tx.send(()).unwrap();
        stream.sync().unwrap();
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn release_queue_outlives_stream() {
        let memory = Arc::new(HostMemory::new(0));
        let stream = HostStream::new(Arc::clone(&memory)).unwrap();
        let queue = stream.release_queue();
        drop(stream);
        let marker = Arc::new(());
        queue.release(Box::new(Arc::clone(&marker)));
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
