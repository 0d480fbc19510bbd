use std::collections::VecDeque;

use futures::stream::{self, Stream};
use ostore_protocol::{ApiOp, StoreMessage, Subject};
use ostore_types::{BucketName, ObjectMetadata};

use crate::error::{StoreError, StoreResult};
use crate::session::TransferSession;

/// Pages through the current revisions of a bucket in commit order.
///
/// [`ObjectLister::cursor`] names the position after the last page fetched;
/// a lister started from that cursor resumes where this one left off.
pub struct ObjectLister {
    session: TransferSession,
    bucket: BucketName,
    cursor: Option<u64>,
    page_size: u32,
    buffered: VecDeque<ObjectMetadata>,
    exhausted: bool,
}

impl ObjectLister {
    pub(crate) fn new(
        session: TransferSession,
        bucket: BucketName,
        cursor: Option<u64>,
        page_size: u32,
    ) -> Self {
        Self {
            session,
            bucket,
            cursor,
            page_size,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Resume point for a later listing.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// The next page, or `None` once every page has been returned.
    pub async fn next_page(&mut self) -> StoreResult<Option<Vec<ObjectMetadata>>> {
        if self.exhausted {
            return Ok(None);
        }
        let request = StoreMessage::ListObjects {
            bucket: self.bucket.clone(),
            after: self.cursor,
            limit: self.page_size,
        };
        let subject = Subject::api(ApiOp::List, Some(&self.bucket));
        match self.session.request(&subject, &request).await? {
            StoreMessage::ObjectPage { entries, last, more } => {
                if last.is_some() {
                    self.cursor = last;
                }
                self.exhausted = !more;
                Ok(Some(entries))
            }
            other => Err(StoreError::unexpected(&other)),
        }
    }

    /// The next entry, fetching pages as needed.
    pub async fn next(&mut self) -> StoreResult<Option<ObjectMetadata>> {
        loop {
            if let Some(meta) = self.buffered.pop_front() {
                return Ok(Some(meta));
            }
            match self.next_page().await? {
                Some(page) => self.buffered.extend(page),
                None => return Ok(None),
            }
        }
    }

    /// Drain the listing into a vector.
    pub async fn collect(mut self) -> StoreResult<Vec<ObjectMetadata>> {
        let mut all = Vec::new();
        while let Some(meta) = self.next().await? {
            all.push(meta);
        }
        Ok(all)
    }

    pub fn into_stream(self) -> impl Stream<Item = StoreResult<ObjectMetadata>> {
        stream::try_unfold(self, |mut lister| async move {
            Ok(lister.next().await?.map(|meta| (meta, lister)))
        })
    }
}
