use std::sync::Arc;

/// An optional callback shared between threads.
///
/// Cloning is cheap: the callable itself lives behind an `Arc`.
pub enum SharedFn<F: ?Sized + Send + Sync + 'static> {
    None,
    Some(Arc<F>),
}

impl<F: ?Sized + Send + Sync + 'static> Clone for SharedFn<F> {
    fn clone(&self) -> Self {
        match self {
            SharedFn::None => SharedFn::None,
            SharedFn::Some(f) => SharedFn::Some(Arc::clone(f)),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for SharedFn<F> {
    fn default() -> Self {
        SharedFn::None
    }
}

impl<F: ?Sized + Send + Sync + 'static> SharedFn<F> {
    pub fn new(f: Arc<F>) -> Self {
        SharedFn::Some(f)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, SharedFn::None)
    }

    pub fn is_some(&self) -> bool {
        matches!(self, SharedFn::Some(_))
    }

    pub fn get(&self) -> Option<&F> {
        match self {
            SharedFn::None => None,
            SharedFn::Some(f) => Some(f.as_ref()),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> std::fmt::Debug for SharedFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharedFn::None => write!(f, "SharedFn::None"),
            SharedFn::Some(_) => write!(f, "SharedFn::Some(..)"),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> From<Arc<F>> for SharedFn<F> {
    fn from(f: Arc<F>) -> Self {
        SharedFn::Some(f)
    }
}

impl<F: ?Sized + Send + Sync + 'static> From<Option<Arc<F>>> for SharedFn<F> {
    fn from(f: Option<Arc<F>>) -> Self {
        match f {
            Some(f) => SharedFn::Some(f),
            None => SharedFn::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Callback = SharedFn<dyn Fn(usize) + Send + Sync>;

    #[test]
    fn default_is_none() {
        let f = Callback::default();
        assert!(f.is_none());
        assert!(f.get().is_none());
    }

    #[test]
    fn clones_share_the_callable() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let f: Callback = SharedFn::new(Arc::new(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        }));
        let g = f.clone();

        f.get().unwrap()(2);
        g.get().unwrap()(3);

        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn from_option() {
        let none: Callback = None.into();
        assert!(none.is_none());

        let some: Callback = Some(Arc::new(|_: usize| {}) as Arc<dyn Fn(usize) + Send + Sync>).into();
        assert!(some.is_some());
        assert_eq!(format!("{some:?}"), "SharedFn::Some(..)");
    }
}
