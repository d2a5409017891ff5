use enigo::{Button, Coordinate, Direction, Enigo, Mouse, Settings};
use tracing::debug;

use crate::error::DispatchError;

/// Synthetic pointer input consumed by the automation worker
pub trait ActionDispatcher {
    /// Move the pointer to absolute desktop coordinates and left-click
    fn click(&mut self, x: i32, y: i32) -> Result<(), DispatchError>;
}

/// Pointer injection through `enigo`.
///
/// On macOS the process needs the Accessibility permission; without it
/// clicks fail and are reported as [`DispatchError::ClickFailed`].
pub struct EnigoDispatcher {
    enigo: Enigo,
}

impl EnigoDispatcher {
    pub fn new() -> Result<Self, DispatchError> {
        let enigo =
            Enigo::new(&Settings::default()).map_err(|err| DispatchError::InitFailed(Box::new(err)))?;
        Ok(Self { enigo })
    }
}

impl ActionDispatcher for EnigoDispatcher {
    fn click(&mut self, x: i32, y: i32) -> Result<(), DispatchError> {
        let failed = |err: enigo::InputError| DispatchError::ClickFailed {
            x,
            y,
            source: Box::new(err),
        };

        self.enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(failed)?;
        self.enigo
            .button(Button::Left, Direction::Click)
            .map_err(failed)?;

        debug!("Clicked at ({x}, {y})");
        Ok(())
    }
}
