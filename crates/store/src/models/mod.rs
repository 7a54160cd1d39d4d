mod comic;
mod key;
mod pending;

pub use self::comic::ComicRecord;
pub(crate) use self::comic::ComicRow;
pub use self::key::ContentKey;
pub use self::pending::PendingMove;
pub(crate) use self::pending::PendingRow;
