// crates/heidi-cli/src/lib.rs
// ============================================================================
// Module: Heidi CLI Library
// Description: Shared helpers for the `heidi` binary.
// Purpose: Expose the message catalog to the binary and its tests.
// Dependencies: Standard library
// ============================================================================

//! ## Overview
//! Library half of the `heidi` command. The binary routes every user-facing
//! string through [`i18n`] and the [`t!`] macro.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod i18n;
