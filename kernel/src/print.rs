// Print macros for kernel console output

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::arch::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
