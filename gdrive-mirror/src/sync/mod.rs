pub mod media_index;
pub mod paths;
pub mod reconcile;
pub mod state;
pub mod transfer;

/// One child of a remote folder as returned by a listing call.
pub type RemoteEntry = gdrive_core::DriveFile;
