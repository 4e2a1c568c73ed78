//! Built-in reference simulation plugins.
//!
//! - [`wander`] -- agents wandering a bounded grid (step-based)
//! - [`dummy_evolution`] -- two-action dummy environment with random agents
//!   and identity evolution (generation-based)
//!
//! Both plugins support checkpoint export and import.

use evolab_core::{PluginRegistry, RegistryError};

pub mod dummy_evolution;
pub mod wander;

/// Register every built-in plugin.
///
/// # Errors
///
/// Returns [`RegistryError::Duplicate`] if a built-in name is already taken.
pub fn register_builtin(registry: &mut PluginRegistry) -> Result<(), RegistryError> {
    registry.register(wander::registration())?;
    registry.register(dummy_evolution::registration())?;
    Ok(())
}

/// A registry holding only the built-in plugins.
pub fn builtin_registry() -> Result<PluginRegistry, RegistryError> {
    let mut registry = PluginRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}
