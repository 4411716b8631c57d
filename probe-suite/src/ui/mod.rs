//! Browser checks. They share the "ui" serial group, so they run in source order on one
//! browser that is closed when the group is done.

mod homepage;
mod login;
