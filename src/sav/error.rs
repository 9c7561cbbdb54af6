use nom::Finish;
use nom::IResult;
use thiserror::Error;

/// Failures raised while decoding a system file.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not an SPSS system file (found magic {0:?})")]
    NotSav(String),
    #[error("malformed or truncated {0}")]
    Parse(String),
    #[error("unsupported {0}")]
    Unsupported(String),
    #[error("invalid case data: {0}")]
    Data(String),
    #[error("zlib block {block} failed to inflate")]
    Inflate {
        block: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Lifts a nom result into our error type, naming the record that failed.
pub trait DownstreamError {
    type MappedResult;
    fn map_res(self, what: &str) -> Self::MappedResult;
}

impl<I, O> DownstreamError for IResult<I, O> {
    type MappedResult = Result<(I, O), Error>;
    fn map_res(self, what: &str) -> Self::MappedResult {
        self.finish().map_err(|_| Error::Parse(String::from(what)))
    }
}
