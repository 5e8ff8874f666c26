use once_cell::sync::OnceCell;

/// How a stream ended.
///
/// `Completed` is the normal-completion marker: it ends a subscription
/// silently, while `Failed` is surfaced as a final `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Terminal<E> {
  Completed,
  Failed(E),
}

/// Write-once terminal state; the first `complete`/`fail` wins.
#[derive(Debug)]
pub(crate) struct TerminalCell<E> {
  cell: OnceCell<Terminal<E>>,
}

impl<E> Default for TerminalCell<E> {
  fn default() -> Self { Self { cell: OnceCell::new() } }
}

impl<E> TerminalCell<E> {
  /// Returns `false` if the cell was already terminal.
  pub(crate) fn complete(&self) -> bool { self.cell.set(Terminal::Completed).is_ok() }

  /// Returns `false` if the cell was already terminal.
  pub(crate) fn fail(&self, err: E) -> bool { self.cell.set(Terminal::Failed(err)).is_ok() }

  pub(crate) fn is_terminated(&self) -> bool { self.cell.get().is_some() }
}

impl<E: Clone> TerminalCell<E> {
  /// The final stream item for this terminal state: `Some(Err(e))` for a
  /// failure, `None` for completion or when still open.
  pub(crate) fn final_item<T>(&self) -> Option<Result<T, E>> {
    match self.cell.get() {
      Some(Terminal::Failed(err)) => Some(Err(err.clone())),
      _ => None,
    }
  }
}
