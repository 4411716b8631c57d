//! Checks of the staging JSON API. Every test logs in through the session store, so a
//! run performs a single login unless `token_scope = "test"`.

mod login;
mod organization;
