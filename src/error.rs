use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// ErrNeedMore indicates a record frame was cut short and the caller
    /// must supply more bytes before retrying.
    #[error("need more data")]
    ErrNeedMore,

    /// ErrChannelNotMapped indicates a record frame whose kind/channel pair
    /// has no interleaved channel assigned.
    #[error("channel is not mapped")]
    ErrChannelNotMapped,

    /// ErrRtpTooShort indicates an RTP packet below the fixed header length.
    #[error("rtp packet is too short")]
    ErrRtpTooShort,

    /// ErrSdpMalformed indicates a session description that could not be
    /// parsed into media sections.
    #[error("sdp malformed")]
    ErrSdpMalformed,

    /// ErrInvalidUrl indicates an RTSP URL that could not be parsed.
    #[error("invalid rtsp url: {0}")]
    ErrInvalidUrl(String),

    /// ErrPlayerExists indicates an attempt to attach a player with an id
    /// already present on the pusher.
    #[error("player {0} already registered")]
    ErrPlayerExists(String),

    /// ErrPusherRejected indicates the registry refused a pusher because the
    /// path is occupied and close-old was not requested.
    #[error("path {0} already has an active pusher")]
    ErrPusherRejected(String),

    /// ErrSessionStopped indicates an operation on a session that has
    /// already run its stop sequence.
    #[error("session stopped")]
    ErrSessionStopped,

    /// ErrRequestMalformed indicates an RTSP request whose request line or
    /// headers could not be parsed.
    #[error("malformed rtsp request")]
    ErrRequestMalformed,

    /// ErrResponseMalformed indicates an RTSP response whose status line
    /// could not be parsed.
    #[error("malformed rtsp response")]
    ErrResponseMalformed,

    /// ErrResponseStatus carries a non-2xx status from a remote RTSP server.
    #[error("remote answered status {0}")]
    ErrResponseStatus(u16),

    /// ErrAuthFailed indicates a digest response that does not match.
    #[error("authentication failed")]
    ErrAuthFailed,

    /// ErrAuthHeaderMalformed indicates an Authorization or WWW-Authenticate
    /// header missing a required field.
    #[error("auth header missing field: {0}")]
    ErrAuthHeaderMalformed(&'static str),

    /// ErrNoStorageAvailable indicates no configured storage root has free
    /// space.
    #[error("no storage path available")]
    ErrNoStorageAvailable,

    /// ErrShortBlockWrite indicates a block write that returned fewer bytes
    /// than the block size.
    #[error("block write returned {actual} of {expected} bytes")]
    ErrShortBlockWrite { actual: usize, expected: usize },

    /// ErrShortBlockRead indicates a block read that could not fill the
    /// whole block buffer.
    #[error("block read incomplete")]
    ErrShortBlockRead,

    /// ErrBlockNotFound indicates a time-index lookup with no block at or
    /// after the requested time.
    #[error("no block found")]
    ErrBlockNotFound,

    /// ErrExecuteNotFound indicates an unknown (task, execution) pair.
    #[error("task execution not found")]
    ErrExecuteNotFound,

    /// ErrTaskNotFound indicates an unknown recording task id.
    #[error("recording task not found")]
    ErrTaskNotFound,

    /// ErrPusherNotFound indicates a path with no registered pusher.
    #[error("no pusher at path {0}")]
    ErrPusherNotFound(String),

    /// ErrInvalidCloseRx indicates a loop started twice: its close receiver
    /// was already taken.
    #[error("close receiver already taken")]
    ErrInvalidCloseRx,

    /// ErrConfigInvalid indicates configuration that fails validation at
    /// startup.
    #[error("invalid configuration: {0}")]
    ErrConfigInvalid(String),

    #[error("IoError: {0}")]
    ErrIoError(#[from] std::io::Error),

    #[error("JsonError: {0}")]
    ErrJsonError(#[from] serde_json::Error),

    #[error("Other errors: {0}")]
    ErrOthers(String),
}
