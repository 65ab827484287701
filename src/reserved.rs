// src/reserved.rs: Reserved Memory Region
//
// Одно анонимное отображение на всю жизнь процесса. Никогда не попадает в снимок
// и не трогается reconciler'ом, поэтому всё, что должно пережить перезапись памяти
// (заголовок движка, таблица потоков, загруженные образы потоков, буферы, стеки
// обработчиков), живёт здесь.
//
// Раскладка (смещения выровнены по странице):
// [header][codec][slots][images][maps][scratch][guard|checkpoint stack][guard|alt 0]..[guard|alt N-1]

use std::io;

use crate::config::{round_up_page, EngineConfig};
use crate::consts::{CHECKPOINT_STACK_SIZE, FRAME_HDR_SIZE, PAGE_SIZE, RUN_BYTES};

/// Под-область: смещение от начала региона и длина.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

/// Разбиение scratch на буферы окна заморозки.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScratchSpans {
    /// Копия серии страниц перед сжатием.
    pub comp_in: Span,
    /// Выход deflate; с запасом под заголовок фрейма.
    pub comp_out: Span,
    /// Распакованная серия и сжатый фрейм для reader'а текущего поколения.
    pub cur_run: Span,
    pub cur_frame: Span,
    /// То же для base.
    pub base_run: Span,
    pub base_frame: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReservedLayout {
    pub header: Span,
    pub codec: Span,
    pub slots: Span,
    pub images: Span,
    pub maps: Span,
    pub scratch: ScratchSpans,
    /// Стек checkpoint-обработчика (без guard-страницы).
    pub checkpoint_stack: Span,
    /// Первый альтернативный стек; стеки идут подряд с шагом `altstack_stride`.
    pub altstacks: Span,
    pub altstack_stride: usize,
    pub altstack_count: usize,
    pub total: usize,
}

struct Cursor {
    at: usize,
}

impl Cursor {
    fn take(&mut self, len: usize) -> Span {
        let len = round_up_page(len.max(1));
        let s = Span {
            offset: self.at,
            len,
        };
        self.at += len;
        s
    }
}

impl ReservedLayout {
    /// Размеры типизированного содержимого задаёт движок (size_of заголовка/слота/...).
    pub fn compute(
        cfg: &EngineConfig,
        header_size: usize,
        codec_size: usize,
        slot_size: usize,
        image_size: usize,
    ) -> Self {
        let mut c = Cursor { at: 0 };
        let header = c.take(header_size);
        let codec = c.take(codec_size);
        let slots = c.take(slot_size * cfg.max_threads);
        let images = c.take(image_size * cfg.max_threads);
        let maps = c.take(cfg.maps_buffer_bytes());
        let scratch = ScratchSpans {
            comp_in: c.take(RUN_BYTES),
            comp_out: c.take(RUN_BYTES + FRAME_HDR_SIZE + PAGE_SIZE),
            cur_run: c.take(RUN_BYTES),
            cur_frame: c.take(RUN_BYTES),
            base_run: c.take(RUN_BYTES),
            base_frame: c.take(RUN_BYTES),
        };
        // guard + стек checkpoint
        c.take(PAGE_SIZE);
        let checkpoint_stack = c.take(CHECKPOINT_STACK_SIZE);
        // guard + стек для каждого слота
        let stride = PAGE_SIZE + cfg.altstack_bytes();
        let first = c.at + PAGE_SIZE;
        c.at += stride * cfg.max_threads;
        Self {
            header,
            codec,
            slots,
            images,
            maps,
            scratch,
            checkpoint_stack,
            altstacks: Span {
                offset: first,
                len: cfg.altstack_bytes(),
            },
            altstack_stride: stride,
            altstack_count: cfg.max_threads,
            total: c.at,
        }
    }

    pub fn altstack(&self, idx: usize) -> Span {
        Span {
            offset: self.altstacks.offset + idx * self.altstack_stride,
            len: self.altstacks.len,
        }
    }
}

/// Зарезервированное отображение. Адрес не меняется после init(), отображение
/// живёт до конца процесса; копия: просто ещё один вид на него.
#[derive(Clone, Copy)]
pub struct ReservedRegion {
    base: *mut u8,
    len: usize,
    layout: ReservedLayout,
}

unsafe impl Send for ReservedRegion {}
unsafe impl Sync for ReservedRegion {}

impl ReservedRegion {
    /// Создать отображение, обнулить служебные части и поставить guard-страницы.
    pub fn init(layout: ReservedLayout) -> io::Result<Self> {
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                layout.total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let region = Self {
            base: p as *mut u8,
            len: layout.total,
            layout,
        };

        // Анонимная память уже нулевая; явно чистим то, что читается как структуры.
        for span in [layout.header, layout.codec, layout.slots, layout.images] {
            unsafe { std::ptr::write_bytes(region.addr(span.offset), 0, span.len) };
        }

        region.guard(layout.checkpoint_stack.offset - PAGE_SIZE)?;
        for i in 0..layout.altstack_count {
            region.guard(layout.altstack(i).offset - PAGE_SIZE)?;
        }
        Ok(region)
    }

    fn guard(&self, offset: usize) -> io::Result<()> {
        let r = unsafe {
            libc::mprotect(
                self.addr(offset) as *mut libc::c_void,
                PAGE_SIZE,
                libc::PROT_NONE,
            )
        };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Указатель на смещение внутри региона.
    #[inline]
    pub fn addr(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len, "reserved offset out of range");
        unsafe { self.base.add(offset) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn layout(&self) -> &ReservedLayout {
        &self.layout
    }

    /// [start, end) региона: для правил пропуска.
    #[inline]
    pub fn range(&self) -> (usize, usize) {
        (self.base as usize, self.base as usize + self.len)
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let (s, e) = self.range();
        addr >= s && addr < e
    }

    /// Изменяемый срез под-области. Владелец: driver под orchestration lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn span_mut(&self, span: Span) -> &'static mut [u8] {
        std::slice::from_raw_parts_mut(self.addr(span.offset), span.len)
    }

    /// Вершина и размер стека для sigaltstack.
    pub fn stack_bounds(&self, span: Span) -> (*mut u8, usize) {
        (self.addr(span.offset), span.len)
    }
}
