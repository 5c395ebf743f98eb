// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Health-check driven enable/disable
//!
//! Agents report the outcome of their local health check on every ping.
//! When the policy is on for a host's sub-cluster, a failing check disables
//! an enabled host and a passing check re-enables it, but only if it was
//! this policy that disabled it.

use agent_control_types::ResourceState;

/// Intent change requested by a health report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentChange {
    pub resource_state: ResourceState,
    pub auto_disabled: bool,
}

/// Decide whether a health report changes a host's intent.
///
/// Administrative intents other than Enabled/Disabled are never touched,
/// nor is a Disabled host the policy did not disable.
pub fn evaluate(
    intent: Option<ResourceState>,
    auto_disabled: bool,
    healthy: bool,
) -> Option<IntentChange> {
    match (intent?, healthy) {
        (ResourceState::Enabled, false) => Some(IntentChange {
            resource_state: ResourceState::Disabled,
            auto_disabled: true,
        }),
        (ResourceState::Disabled, true) if auto_disabled => Some(IntentChange {
            resource_state: ResourceState::Enabled,
            auto_disabled: false,
        }),
        _ => None,
    }
}
