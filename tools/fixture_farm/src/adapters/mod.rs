//! Store adapters implementing [`crate::model::DataStore`] and
//! [`crate::model::NotificationBus`].

pub mod sqlite;
