//! System chat lines about downloads.
//!
//! A refused or failed download is reported to the requester as an opcode 5
//! line. Both ends build and recognise those lines here so the client can
//! release its pending request for the file.

const UNAVAILABLE_PREFIX: &str = "File ";
const UNAVAILABLE_SUFFIX: &str = " is not available";
const FAILED_PREFIX: &str = "Download of ";
const FAILED_SUFFIX: &str = " failed (server storage error)";

/// Why a download did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadNotice<'a> {
    /// No stored file has this name
    Unavailable(&'a str),
    /// The server could not read the stored file
    Failed(&'a str),
}

impl<'a> DownloadNotice<'a> {
    /// Recognise a download notice in a system chat line
    ///
    /// # Example
    ///
    /// ```
    /// use chatwire_proto::notice::DownloadNotice;
    ///
    /// assert_eq!(
    ///     DownloadNotice::parse("File a.txt is not available"),
    ///     Some(DownloadNotice::Unavailable("a.txt"))
    /// );
    /// assert_eq!(DownloadNotice::parse("bob: hi"), None);
    /// ```
    #[must_use]
    pub fn parse(line: &'a str) -> Option<Self> {
        let between = |prefix: &str, suffix: &str| {
            line.strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
                .filter(|name| !name.is_empty())
        };

        between(UNAVAILABLE_PREFIX, UNAVAILABLE_SUFFIX)
            .map(DownloadNotice::Unavailable)
            .or_else(|| between(FAILED_PREFIX, FAILED_SUFFIX).map(DownloadNotice::Failed))
    }

    /// File name the notice refers to
    #[must_use]
    pub fn file_name(&self) -> &'a str {
        match *self {
            DownloadNotice::Unavailable(name) | DownloadNotice::Failed(name) => name,
        }
    }

    /// The chat line for this notice
    #[must_use]
    pub fn line(&self) -> String {
        match self {
            DownloadNotice::Unavailable(name) => {
                format!("{UNAVAILABLE_PREFIX}{name}{UNAVAILABLE_SUFFIX}")
            }
            DownloadNotice::Failed(name) => format!("{FAILED_PREFIX}{name}{FAILED_SUFFIX}"),
        }
    }
}
