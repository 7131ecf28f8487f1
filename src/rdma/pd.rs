use std::sync::Arc;
use std::{fmt, io};

use super::context::{Context, ResourceKind};
use super::type_alias::PdNum;
#[cfg(feature = "verbs")]
use super::verbs::RawPd;

struct PdInner {
    #[cfg(feature = "verbs")]
    raw: Option<RawPd>,
    ctx: Context,
    pdn: PdNum,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        log::trace!("rwbench: dealloc PD {}", self.pdn);
        self.ctx.release(ResourceKind::Pd);
    }
}

/// Protection domain.
///
/// This type is a simple wrapper of an `Arc`; the domain is deallocated when
/// the last clone (including the ones held by memory regions and queue pairs
/// created in it) is dropped.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pd").field("pdn", &self.inner.pdn).finish()
    }
}

impl Pd {
    /// Allocate a new protection domain on the given device.
    pub fn new(ctx: &Context) -> io::Result<Self> {
        ctx.acquire(ResourceKind::Pd)?;

        #[cfg(feature = "verbs")]
        if let Some(raw_ctx) = ctx.raw() {
            let raw = match RawPd::alloc(raw_ctx) {
                Ok(raw) => raw,
                Err(e) => {
                    ctx.release(ResourceKind::Pd);
                    return Err(e);
                }
            };
            return Ok(Self {
                inner: Arc::new(PdInner {
                    pdn: raw.handle(),
                    raw: Some(raw),
                    ctx: ctx.clone(),
                }),
            });
        }

        Ok(Self {
            inner: Arc::new(PdInner {
                #[cfg(feature = "verbs")]
                raw: None,
                ctx: ctx.clone(),
                pdn: ctx.alloc_pdn(),
            }),
        })
    }

    #[cfg(feature = "verbs")]
    #[inline]
    pub(crate) fn raw(&self) -> Option<&RawPd> {
        self.inner.raw.as_ref()
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the protection domain number.
    #[inline]
    pub fn pdn(&self) -> PdNum {
        self.inner.pdn
    }
}

impl PartialEq for Pd {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pd {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::DeviceAttr;

    #[test]
    fn dealloc_on_last_drop() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let pd = Pd::new(&ctx).unwrap();
        let pd2 = pd.clone();
        assert_eq!(pd, pd2);
        assert_eq!(ctx.usage().pds, 1);

        drop(pd);
        assert_eq!(ctx.usage().pds, 1);
        drop(pd2);
        assert_eq!(ctx.usage().pds, 0);
    }
}
