//! Стабильный хеш содержимого областей памяти (xxhash64, seed=0).
//!
//! Считается по страницам, у которых есть содержимое (всё, кроме NoPage), в порядке
//! адресов. Запись в поток: u64 после флагов области (0 = хеш не считался).

use std::hash::Hasher;
use twox_hash::XxHash64;

/// Инкрементальный хешер области. Без аллокаций, живёт на стеке.
pub struct AreaHasher {
    inner: XxHash64,
    pages: u64,
}

impl AreaHasher {
    pub fn new() -> Self {
        Self {
            inner: XxHash64::with_seed(0),
            pages: 0,
        }
    }

    #[inline]
    pub fn page(&mut self, bytes: &[u8]) {
        self.inner.write(bytes);
        self.pages += 1;
    }

    /// Итог. Пустая область даёт 0, чтобы не путать с «хеш не считался».
    pub fn finish(&self) -> u64 {
        if self.pages == 0 {
            return 0;
        }
        match self.inner.finish() {
            0 => 1,
            h => h,
        }
    }
}

impl Default for AreaHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Хеш одного буфера (для тестов и verify).
pub fn hash64(bytes: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(bytes);
    h.finish()
}

/// Все ли байты страницы нулевые.
#[inline]
pub fn is_zero_page(page: &[u8]) -> bool {
    let (pre, mid, post) = unsafe { page.align_to::<u64>() };
    pre.iter().all(|b| *b == 0) && mid.iter().all(|w| *w == 0) && post.iter().all(|b| *b == 0)
}
