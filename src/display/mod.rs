//! Display resolution management via `xrandr`/`cvt`.

pub mod resizer;
