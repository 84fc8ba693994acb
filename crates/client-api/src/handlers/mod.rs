//! Verb handler bundles. Modules register their verbs by taking a
//! `&mut Dispatcher`; the gateway ships the "basics" bundle.

pub mod basics;
