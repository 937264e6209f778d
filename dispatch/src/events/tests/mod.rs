// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end scenarios for the event manager: real pipes, real signals, real
//! timers, dispatched onto a real pool.

mod event_manager_tests;
mod timer_tests;
