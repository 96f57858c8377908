/*
 * Copyright 2026 Oxide Computer Company
 */

pub mod agent;
pub mod bootfs;
pub mod common;
pub mod file;
pub mod image;
pub mod media;
pub mod profile;
pub mod trigger;
