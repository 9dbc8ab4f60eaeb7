//! Naked per-vector interrupt stubs.
//!
//! Every stub normalizes the stack to the uniform [`InterruptFrame`]
//! layout: vectors whose exceptions push an error code push only their
//! vector number, all others push a zero placeholder first. The common tail
//! saves the full register file, hands the frame pointer to the dispatch
//! core, restores everything, and `iretq`s — so a handler that edits the
//! frame (the scheduler tick) changes where `iretq` lands.
//!
//! Stack alignment: the hardware frame plus our pushes total an odd/even
//! word count such that RSP is 16-byte aligned at the `call` in both the
//! error-code and no-error-code variants.
//!
//! [`InterruptFrame`]: crate::isr::InterruptFrame

use crate::isr::InterruptFrame;

/// The common stub tail: spill the register file, dispatch, reload, return.
#[unsafe(naked)]
unsafe extern "C" fn isr_common() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Drop int_no and err_code.
        "add rsp, 16",
        "iretq",
        dispatch = sym dispatch_entry,
    );
}

/// Rust-side landing point for the common stub.
extern "C" fn dispatch_entry(frame: *mut InterruptFrame) {
    // SAFETY: The stub built a complete InterruptFrame at `frame` and owns
    // that stack region until iretq.
    crate::isr::dispatch(unsafe { &mut *frame });
}

/// Defines a stub for a vector without a CPU error code.
macro_rules! make_stub {
    ($vector:expr) => {{
        #[unsafe(naked)]
        unsafe extern "C" fn stub() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common,
            );
        }
        stub as unsafe extern "C" fn()
    }};
}

/// Defines a stub for a vector whose exception pushes an error code.
macro_rules! make_stub_err {
    ($vector:expr) => {{
        #[unsafe(naked)]
        unsafe extern "C" fn stub() {
            core::arch::naked_asm!(
                // The CPU already pushed the error code.
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common,
            );
        }
        stub as unsafe extern "C" fn()
    }};
}

/// All 256 stubs, indexed by vector. Error-code vectors: 8, 10-14, 17, 21,
/// 29, 30.
pub static STUBS: [unsafe extern "C" fn(); 256] = [
    // 0-15: exceptions
    make_stub!(0),
    make_stub!(1),
    make_stub!(2),
    make_stub!(3),
    make_stub!(4),
    make_stub!(5),
    make_stub!(6),
    make_stub!(7),
    make_stub_err!(8),
    make_stub!(9),
    make_stub_err!(10),
    make_stub_err!(11),
    make_stub_err!(12),
    make_stub_err!(13),
    make_stub_err!(14),
    make_stub!(15),
    // 16-31: exceptions
    make_stub!(16),
    make_stub_err!(17),
    make_stub!(18),
    make_stub!(19),
    make_stub!(20),
    make_stub_err!(21),
    make_stub!(22),
    make_stub!(23),
    make_stub!(24),
    make_stub!(25),
    make_stub!(26),
    make_stub!(27),
    make_stub!(28),
    make_stub_err!(29),
    make_stub_err!(30),
    make_stub!(31),
    // 32-47: legacy IRQs
    make_stub!(32),
    make_stub!(33),
    make_stub!(34),
    make_stub!(35),
    make_stub!(36),
    make_stub!(37),
    make_stub!(38),
    make_stub!(39),
    make_stub!(40),
    make_stub!(41),
    make_stub!(42),
    make_stub!(43),
    make_stub!(44),
    make_stub!(45),
    make_stub!(46),
    make_stub!(47),
    // 48-63
    make_stub!(48),
    make_stub!(49),
    make_stub!(50),
    make_stub!(51),
    make_stub!(52),
    make_stub!(53),
    make_stub!(54),
    make_stub!(55),
    make_stub!(56),
    make_stub!(57),
    make_stub!(58),
    make_stub!(59),
    make_stub!(60),
    make_stub!(61),
    make_stub!(62),
    make_stub!(63),
    // 64-79
    make_stub!(64),
    make_stub!(65),
    make_stub!(66),
    make_stub!(67),
    make_stub!(68),
    make_stub!(69),
    make_stub!(70),
    make_stub!(71),
    make_stub!(72),
    make_stub!(73),
    make_stub!(74),
    make_stub!(75),
    make_stub!(76),
    make_stub!(77),
    make_stub!(78),
    make_stub!(79),
    // 80-95
    make_stub!(80),
    make_stub!(81),
    make_stub!(82),
    make_stub!(83),
    make_stub!(84),
    make_stub!(85),
    make_stub!(86),
    make_stub!(87),
    make_stub!(88),
    make_stub!(89),
    make_stub!(90),
    make_stub!(91),
    make_stub!(92),
    make_stub!(93),
    make_stub!(94),
    make_stub!(95),
    // 96-111
    make_stub!(96),
    make_stub!(97),
    make_stub!(98),
    make_stub!(99),
    make_stub!(100),
    make_stub!(101),
    make_stub!(102),
    make_stub!(103),
    make_stub!(104),
    make_stub!(105),
    make_stub!(106),
    make_stub!(107),
    make_stub!(108),
    make_stub!(109),
    make_stub!(110),
    make_stub!(111),
    // 112-127
    make_stub!(112),
    make_stub!(113),
    make_stub!(114),
    make_stub!(115),
    make_stub!(116),
    make_stub!(117),
    make_stub!(118),
    make_stub!(119),
    make_stub!(120),
    make_stub!(121),
    make_stub!(122),
    make_stub!(123),
    make_stub!(124),
    make_stub!(125),
    make_stub!(126),
    make_stub!(127),
    // 128-143
    make_stub!(128),
    make_stub!(129),
    make_stub!(130),
    make_stub!(131),
    make_stub!(132),
    make_stub!(133),
    make_stub!(134),
    make_stub!(135),
    make_stub!(136),
    make_stub!(137),
    make_stub!(138),
    make_stub!(139),
    make_stub!(140),
    make_stub!(141),
    make_stub!(142),
    make_stub!(143),
    // 144-159
    make_stub!(144),
    make_stub!(145),
    make_stub!(146),
    make_stub!(147),
    make_stub!(148),
    make_stub!(149),
    make_stub!(150),
    make_stub!(151),
    make_stub!(152),
    make_stub!(153),
    make_stub!(154),
    make_stub!(155),
    make_stub!(156),
    make_stub!(157),
    make_stub!(158),
    make_stub!(159),
    // 160-175
    make_stub!(160),
    make_stub!(161),
    make_stub!(162),
    make_stub!(163),
    make_stub!(164),
    make_stub!(165),
    make_stub!(166),
    make_stub!(167),
    make_stub!(168),
    make_stub!(169),
    make_stub!(170),
    make_stub!(171),
    make_stub!(172),
    make_stub!(173),
    make_stub!(174),
    make_stub!(175),
    // 176-191
    make_stub!(176),
    make_stub!(177),
    make_stub!(178),
    make_stub!(179),
    make_stub!(180),
    make_stub!(181),
    make_stub!(182),
    make_stub!(183),
    make_stub!(184),
    make_stub!(185),
    make_stub!(186),
    make_stub!(187),
    make_stub!(188),
    make_stub!(189),
    make_stub!(190),
    make_stub!(191),
    // 192-207
    make_stub!(192),
    make_stub!(193),
    make_stub!(194),
    make_stub!(195),
    make_stub!(196),
    make_stub!(197),
    make_stub!(198),
    make_stub!(199),
    make_stub!(200),
    make_stub!(201),
    make_stub!(202),
    make_stub!(203),
    make_stub!(204),
    make_stub!(205),
    make_stub!(206),
    make_stub!(207),
    // 208-223
    make_stub!(208),
    make_stub!(209),
    make_stub!(210),
    make_stub!(211),
    make_stub!(212),
    make_stub!(213),
    make_stub!(214),
    make_stub!(215),
    make_stub!(216),
    make_stub!(217),
    make_stub!(218),
    make_stub!(219),
    make_stub!(220),
    make_stub!(221),
    make_stub!(222),
    make_stub!(223),
    // 224-239
    make_stub!(224),
    make_stub!(225),
    make_stub!(226),
    make_stub!(227),
    make_stub!(228),
    make_stub!(229),
    make_stub!(230),
    make_stub!(231),
    make_stub!(232),
    make_stub!(233),
    make_stub!(234),
    make_stub!(235),
    make_stub!(236),
    make_stub!(237),
    make_stub!(238),
    make_stub!(239),
    // 240-255: timer, halt IPI, scheduler yield, spurious
    make_stub!(240),
    make_stub!(241),
    make_stub!(242),
    make_stub!(243),
    make_stub!(244),
    make_stub!(245),
    make_stub!(246),
    make_stub!(247),
    make_stub!(248),
    make_stub!(249),
    make_stub!(250),
    make_stub!(251),
    make_stub!(252),
    make_stub!(253),
    make_stub!(254),
    make_stub!(255),
];
