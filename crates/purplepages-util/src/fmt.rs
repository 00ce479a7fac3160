use std::error::Error;
use std::fmt;

/// Compact single-line rendering of an error and its source chain.
///
/// Log lines carry structured fields already; the multi-line `Debug`
/// rendering of wrapped errors just buries them.
pub struct CompactError<'e, E: ?Sized>(&'e E);

impl<E> fmt::Display for CompactError<'_, E>
where
    E: Error + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    type Fmt<'e>: fmt::Display
    where
        Self: 'e;

    fn fmt_compact(&self) -> Self::Fmt<'_>;
}

impl<E> FmtCompact for E
where
    E: Error + ?Sized,
{
    type Fmt<'e>
        = CompactError<'e, E>
    where
        Self: 'e;

    fn fmt_compact(&self) -> Self::Fmt<'_> {
        CompactError(self)
    }
}
