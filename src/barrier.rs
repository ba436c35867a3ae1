use bitvec::vec::BitVec;
use crossbeam::channel;

/// Posted by a wavefront to its work-group barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    /// Wavefront executed `s_barrier`.
    Arrived { wavefront: usize },
    /// Wavefront executed `s_endpgm`.
    Retired { wavefront: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(
        "barrier divergence in work-group {work_group}: wavefront {wavefront} retired while wavefronts {waiting:?} wait at the barrier"
    )]
    RetiredWhileWaiting {
        work_group: usize,
        wavefront: usize,
        waiting: Vec<usize>,
    },
    #[error(
        "barrier divergence in work-group {work_group}: wavefront {wavefront} arrived at the barrier after wavefronts {retired:?} retired"
    )]
    ArrivedAfterRetire {
        work_group: usize,
        wavefront: usize,
        retired: Vec<usize>,
    },
    #[error("work-group {work_group} has no wavefront {wavefront}")]
    UnknownWavefront { work_group: usize, wavefront: usize },
    #[error("barrier of work-group {work_group} dropped {message:?}")]
    Disconnected { work_group: usize, message: Message },
    #[error("wavefront {wavefront} of work-group {work_group} is already {state}")]
    InvalidTransition {
        work_group: usize,
        wavefront: usize,
        state: &'static str,
    },
}

/// Rendezvous of the wavefronts of one work-group.
///
/// Wavefronts post [`Message`]s, [`Barrier::synchronize`] drains them in
/// order and releases all waiters once every wavefront of the group arrived.
#[derive(Debug)]
pub struct Barrier {
    work_group: usize,
    waiting: BitVec,
    retired: BitVec,
    num_releases: u64,
    sender: channel::Sender<Message>,
    receiver: channel::Receiver<Message>,
}

impl Barrier {
    #[must_use]
    pub fn new(work_group: usize, num_wavefronts: usize) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            work_group,
            waiting: BitVec::repeat(false, num_wavefronts),
            retired: BitVec::repeat(false, num_wavefronts),
            num_releases: 0,
            sender,
            receiver,
        }
    }

    #[must_use]
    pub fn num_wavefronts(&self) -> usize {
        self.waiting.len()
    }

    /// Number of wavefronts waiting at the barrier.
    #[must_use]
    pub fn count(&self) -> usize {
        self.waiting.count_ones()
    }

    #[must_use]
    pub fn is_waiting(&self, wavefront: usize) -> bool {
        self.waiting.get(wavefront).is_some_and(|bit| *bit)
    }

    #[must_use]
    pub fn num_releases(&self) -> u64 {
        self.num_releases
    }

    /// Sending half for wavefronts of this work-group.
    #[must_use]
    pub fn sender(&self) -> channel::Sender<Message> {
        self.sender.clone()
    }

    pub fn post(&self, message: Message) -> Result<(), Error> {
        self.sender
            .send(message)
            .map_err(|channel::SendError(message)| Error::Disconnected {
                work_group: self.work_group,
                message,
            })
    }

    /// Apply all posted messages.
    ///
    /// Returns the wavefronts released by this call, in ascending order.
    pub fn synchronize(&mut self) -> Result<Vec<usize>, Error> {
        let mut released = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                Message::Arrived { wavefront } => {
                    self.arrive(wavefront)?;
                    if self.count() == self.num_wavefronts() {
                        released.extend(self.waiting.iter_ones());
                        self.waiting.fill(false);
                        self.num_releases += 1;
                        log::debug!(
                            "work-group {}: barrier released {} wavefronts",
                            self.work_group,
                            self.num_wavefronts()
                        );
                    }
                }
                Message::Retired { wavefront } => self.retire(wavefront)?,
            }
        }
        released.sort_unstable();
        Ok(released)
    }

    fn check(&self, wavefront: usize) -> Result<(), Error> {
        if wavefront >= self.num_wavefronts() {
            return Err(Error::UnknownWavefront {
                work_group: self.work_group,
                wavefront,
            });
        }
        let state = if self.retired[wavefront] {
            "retired"
        } else if self.waiting[wavefront] {
            "waiting"
        } else {
            return Ok(());
        };
        Err(Error::InvalidTransition {
            work_group: self.work_group,
            wavefront,
            state,
        })
    }

    fn arrive(&mut self, wavefront: usize) -> Result<(), Error> {
        self.check(wavefront)?;
        if self.retired.any() {
            return Err(Error::ArrivedAfterRetire {
                work_group: self.work_group,
                wavefront,
                retired: self.retired.iter_ones().collect(),
            });
        }
        self.waiting.set(wavefront, true);
        log::trace!(
            "work-group {}: wavefront {} arrived at barrier ({}/{})",
            self.work_group,
            wavefront,
            self.count(),
            self.num_wavefronts()
        );
        Ok(())
    }

    fn retire(&mut self, wavefront: usize) -> Result<(), Error> {
        self.check(wavefront)?;
        if self.waiting.any() {
            return Err(Error::RetiredWhileWaiting {
                work_group: self.work_group,
                wavefront,
                waiting: self.waiting.iter_ones().collect(),
            });
        }
        self.retired.set(wavefront, true);
        Ok(())
    }
}
