use std::collections::VecDeque;
use std::ops::Bound;

use bytes::Bytes;

use crate::engine::Engine;

const DEFAULT_PAGE_SIZE: usize = 256;

/// Iterador preguiçoso em ordem crescente de chave.
///
/// Busca páginas da tabela sob o lock de leitura e o solta entre páginas,
/// então nunca bloqueia writers por mais do que uma página. Cada página é
/// consistente; entre páginas o iterador continua a partir da última chave
/// entregue, enxergando escritas concorrentes que caiam adiante do cursor.
pub struct RangeIter {
    engine: Engine,
    cursor: Bound<Bytes>,
    prefix: Option<Bytes>,
    buffer: VecDeque<(Bytes, Bytes)>,
    page_size: usize,
    exhausted: bool,
}

impl RangeIter {
    pub(crate) fn new(engine: Engine, lower: Bytes, prefix: Option<Bytes>) -> Self {
        Self {
            engine,
            cursor: Bound::Included(lower),
            prefix,
            buffer: VecDeque::new(),
            page_size: DEFAULT_PAGE_SIZE,
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn refill(&mut self) {
        let table = self.engine.read_table();
        let lower = match &self.cursor {
            Bound::Included(k) => Bound::Included(&k[..]),
            Bound::Excluded(k) => Bound::Excluded(&k[..]),
            Bound::Unbounded => Bound::Unbounded,
        };

        let mut pulled = 0;
        for (key, value) in table.range::<[u8], _>((lower, Bound::Unbounded)) {
            if pulled == self.page_size {
                break;
            }
            if let Some(prefix) = &self.prefix
                && !key.starts_with(prefix)
            {
                self.exhausted = true;
                break;
            }
            self.buffer.push_back((key.clone(), value.clone()));
            pulled += 1;
        }

        if pulled < self.page_size {
            self.exhausted = true;
        }
        if let Some((key, _)) = self.buffer.back() {
            self.cursor = Bound::Excluded(key.clone());
        }
    }
}

impl Iterator for RangeIter {
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill();
        }
        self.buffer.pop_front()
    }
}
