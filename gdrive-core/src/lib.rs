mod auth;
mod client;

pub use auth::{AccessToken, AuthError, DRIVE_READONLY_SCOPE, ServiceAccount, ServiceAccountAuth};
pub use client::{
    ApiErrorClass, DriveClient, DriveError, DriveFile, FOLDER_MIME_TYPE, NATIVE_MIME_PREFIX,
};
