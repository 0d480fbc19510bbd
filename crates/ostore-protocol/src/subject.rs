use std::fmt;

use ostore_types::{BucketName, ObjectName, RevisionId};

use crate::error::{ProtocolError, ProtocolResult};

/// Root token of every object store subject.
pub const SUBJECT_PREFIX: &str = "$O";

/// Bucket-level operations carried on `$O.API.<OP>[.<bucket>]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiOp {
    Create,
    Info,
    Buckets,
    List,
    Abort,
    Release,
}

impl ApiOp {
    pub fn token(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Info => "INFO",
            Self::Buckets => "BUCKETS",
            Self::List => "LIST",
            Self::Abort => "ABORT",
            Self::Release => "RELEASE",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "CREATE" => Self::Create,
            "INFO" => Self::Info,
            "BUCKETS" => Self::Buckets,
            "LIST" => Self::List,
            "ABORT" => Self::Abort,
            "RELEASE" => Self::Release,
            _ => return None,
        })
    }
}

/// A named channel on the transport.
///
/// ```text
/// $O.<bucket>.C.<revision>       chunk writes and reads of one revision
/// $O.<bucket>.M.<encoded name>   metadata operations on one object
/// $O.API.<OP>[.<bucket>]         bucket-level operations
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Subject {
    Chunk {
        bucket: BucketName,
        revision: RevisionId,
    },
    Meta {
        bucket: BucketName,
        name: ObjectName,
    },
    Api {
        op: ApiOp,
        bucket: Option<BucketName>,
    },
}

impl Subject {
    pub fn chunk(bucket: &BucketName, revision: RevisionId) -> Self {
        Self::Chunk {
            bucket: bucket.clone(),
            revision,
        }
    }

    pub fn meta(bucket: &BucketName, name: &ObjectName) -> Self {
        Self::Meta {
            bucket: bucket.clone(),
            name: name.clone(),
        }
    }

    pub fn api(op: ApiOp, bucket: Option<&BucketName>) -> Self {
        Self::Api {
            op,
            bucket: bucket.cloned(),
        }
    }

    /// The bucket this subject addresses, if any.
    pub fn bucket(&self) -> Option<&BucketName> {
        match self {
            Self::Chunk { bucket, .. } | Self::Meta { bucket, .. } => Some(bucket),
            Self::Api { bucket, .. } => bucket.as_ref(),
        }
    }

    pub fn parse(s: &str) -> ProtocolResult<Self> {
        let invalid = |reason: &str| ProtocolError::InvalidSubject {
            subject: s.into(),
            reason: reason.into(),
        };
        let tokens: Vec<&str> = s.split('.').collect();
        if tokens.first() != Some(&SUBJECT_PREFIX) {
            return Err(invalid("missing $O prefix"));
        }
        let bucket = |t: &str| BucketName::new(t).map_err(|e| invalid(&e.to_string()));
        match tokens.as_slice() {
            [_, "API", op] => {
                let op = ApiOp::from_token(op).ok_or_else(|| invalid("unknown api op"))?;
                Ok(Self::Api { op, bucket: None })
            }
            [_, "API", op, b] => {
                let op = ApiOp::from_token(op).ok_or_else(|| invalid("unknown api op"))?;
                Ok(Self::Api {
                    op,
                    bucket: Some(bucket(b)?),
                })
            }
            [_, b, "C", rev] => Ok(Self::Chunk {
                bucket: bucket(b)?,
                revision: RevisionId::parse(rev).map_err(|e| invalid(&e.to_string()))?,
            }),
            [_, b, "M", name] => Ok(Self::Meta {
                bucket: bucket(b)?,
                name: ObjectName::from_encoded(name).map_err(|e| invalid(&e.to_string()))?,
            }),
            _ => Err(invalid("unrecognized layout")),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunk { bucket, revision } => {
                write!(f, "{SUBJECT_PREFIX}.{bucket}.C.{revision}")
            }
            Self::Meta { bucket, name } => {
                write!(f, "{SUBJECT_PREFIX}.{bucket}.M.{}", name.encoded())
            }
            Self::Api { op, bucket: None } => write!(f, "{SUBJECT_PREFIX}.API.{}", op.token()),
            Self::Api {
                op,
                bucket: Some(b),
            } => write!(f, "{SUBJECT_PREFIX}.API.{}.{b}", op.token()),
        }
    }
}
