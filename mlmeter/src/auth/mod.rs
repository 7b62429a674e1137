//! Authentication.
//!
//! Accounts sign up and log in with a username and password. Passwords are stored as Argon2id
//! PHC strings ([`password`]). A successful login returns an HS256 JWT whose subject is the
//! username ([`session`]); authenticated handlers take a [`current_user::CurrentUser`], which
//! reads the token from the `Authorization: Bearer` header.

pub mod current_user;
pub mod password;
pub mod session;
