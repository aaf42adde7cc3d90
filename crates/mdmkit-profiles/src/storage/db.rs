//! `SQLite` database handle for the profile engine.

mdmkit_core::define_database!(MdmDatabase, "MDM database migrations complete");
