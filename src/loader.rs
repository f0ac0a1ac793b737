use crate::node::PageRef;
use crate::{CacheError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, warn};

/// Backing storage that fills one page-sized buffer at a byte offset.
pub trait PageSource: Send + Sync {
    /// Fill all of `buf` from `offset`. A short read is an error.
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl<F> PageSource for F
where
    F: Fn(u64, &mut [u8]) -> io::Result<()> + Send + Sync,
{
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self(offset, buf)
    }
}

/// Positional reads from a file, safe to share between concurrent loads.
#[derive(Debug)]
pub struct FilePageSource {
    file: File,
    path: PathBuf,
}

impl FilePageSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| CacheError::Open {
            path: path.clone(),
            source: e.into(),
        })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PageSource for FilePageSource {
    #[cfg(unix)]
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_page(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Completion state of a load: `None` until the leader publishes a result.
pub(crate) type LoadState = Option<Result<PageRef>>;

/// Result of claiming a page id for loading.
pub(crate) enum Claim {
    /// The caller performs the load and must [`finish`](InFlightLoads::finish) it.
    Leader(LoadTicket),
    /// Another load is in flight; wait on its completion handle.
    Follower(watch::Receiver<LoadState>),
}

pub(crate) struct LoadTicket {
    page_id: i64,
    token: u64,
    tx: watch::Sender<LoadState>,
}

impl LoadTicket {
    pub fn page_id(&self) -> i64 {
        self.page_id
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.tx.subscribe()
    }
}

struct Registration {
    token: u64,
    rx: watch::Receiver<LoadState>,
}

#[derive(Default)]
struct Pending {
    loads: HashMap<i64, Registration>,
    next_token: u64,
}

/// Loads in flight, at most one per page id.
pub(crate) struct InFlightLoads {
    pending: Mutex<Pending>,
}

impl InFlightLoads {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Claim `page_id`, or follow the load already registered for it.
    ///
    /// A registration whose leader dropped its ticket without finishing is
    /// abandoned and handed to the new claimant.
    pub fn claim(&self, page_id: i64) -> Claim {
        let mut pending = self.pending.lock();
        if let Some(registration) = pending.loads.get(&page_id) {
            if registration.rx.has_changed().is_ok() {
                return Claim::Follower(registration.rx.clone());
            }
            warn!(page_id, "replacing an abandoned load");
        }

        pending.next_token += 1;
        let token = pending.next_token;
        let (tx, rx) = watch::channel(None);
        pending.loads.insert(page_id, Registration { token, rx });
        Claim::Leader(LoadTicket { page_id, token, tx })
    }

    /// Unregister the load and wake its waiters with `result`.
    ///
    /// Finding another load registered for the same page means two loads ran
    /// at once; that load's registration is left in place and the result
    /// becomes [`CacheError::ConcurrentLoad`].
    pub fn finish(&self, ticket: LoadTicket, result: Result<PageRef>) -> Result<PageRef> {
        let page_id = ticket.page_id;
        let result = {
            let mut pending = self.pending.lock();
            match pending.loads.get(&page_id) {
                Some(registration) if registration.token == ticket.token => {
                    pending.loads.remove(&page_id);
                    result
                }
                _ => {
                    error!(page_id, "broken invariant: concurrent loads of one page");
                    Err(CacheError::ConcurrentLoad { page_id })
                }
            }
        };

        // Waiters may all be gone; that is fine
        let _ = ticket.tx.send(Some(result.clone()));
        result
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().loads.len()
    }
}

/// Wait for a load to complete.
///
/// `Ok(None)` means the leader vanished without a result and the caller
/// should look the page up again.
pub(crate) async fn wait_for(mut rx: watch::Receiver<LoadState>) -> Result<Option<PageRef>> {
    match rx.wait_for(|state| state.is_some()).await {
        Ok(state) => match &*state {
            Some(Ok(entry)) => Ok(Some(*entry)),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(None),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn one_leader_per_page() {
        let loads = InFlightLoads::new();
        let Claim::Leader(ticket) = loads.claim(5) else {
            panic!("first claim must lead");
        };
        assert!(matches!(loads.claim(5), Claim::Follower(_)));
        assert!(matches!(loads.claim(6), Claim::Leader(_)));

        let entry = PageRef { slot: 1, version: 2 };
        assert_eq!(loads.finish(ticket, Ok(entry)).unwrap(), entry);
        assert!(matches!(loads.claim(5), Claim::Leader(_)));
    }

    #[test]
    fn finishing_a_replaced_load_is_an_invariant_violation() {
        let loads = InFlightLoads::new();
        let Claim::Leader(first) = loads.claim(5) else {
            panic!("first claim must lead");
        };
        // Simulate a second load slipping in behind the first one's back
        loads.pending.lock().loads.remove(&5);
        let Claim::Leader(second) = loads.claim(5) else {
            panic!("second claim must lead");
        };

        let entry = PageRef { slot: 1, version: 2 };
        assert!(matches!(
            loads.finish(first, Ok(entry)),
            Err(CacheError::ConcurrentLoad { page_id: 5 })
        ));
        assert_eq!(loads.len(), 1);
        assert!(loads.finish(second, Ok(entry)).is_ok());
        assert_eq!(loads.len(), 0);
    }

    #[tokio::test]
    async fn followers_see_the_leaders_result() {
        let loads = InFlightLoads::new();
        let Claim::Leader(ticket) = loads.claim(9) else {
            panic!("first claim must lead");
        };
        let Claim::Follower(rx) = loads.claim(9) else {
            panic!("second claim must follow");
        };

        let waiter = tokio::spawn(wait_for(rx));
        let entry = PageRef { slot: 3, version: 4 };
        loads.finish(ticket, Ok(entry)).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Some(entry));
    }

    #[tokio::test]
    async fn abandoned_load_releases_followers() {
        let loads = InFlightLoads::new();
        let Claim::Leader(ticket) = loads.claim(9) else {
            panic!("first claim must lead");
        };
        let Claim::Follower(rx) = loads.claim(9) else {
            panic!("second claim must follow");
        };
        drop(ticket);
        assert_eq!(wait_for(rx).await.unwrap(), None);

        // The next claim takes over instead of following a dead load
        let Claim::Leader(ticket) = loads.claim(9) else {
            panic!("abandoned load must be replaced");
        };
        let entry = PageRef { slot: 1, version: 1 };
        assert_eq!(loads.finish(ticket, Ok(entry)).unwrap(), entry);
        assert_eq!(loads.len(), 0);
    }

    #[test]
    fn file_source_reads_at_offsets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..64u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let source = FilePageSource::open(file.path()).unwrap();
        let mut buf = [0u8; 16];
        source.read_page(16, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[16..32]);

        let err = source.read_page(56, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FilePageSource::open(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, CacheError::Open { .. }));
    }
}
