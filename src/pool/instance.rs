//! Pooled runtime instances and secure clearing

use std::ptr;
use std::sync::atomic::{compiler_fence, Ordering};

/// Operand stack depth of a fresh [`RuntimeInstance`]
pub const DEFAULT_STACK_WORDS: usize = 256;

/// Local variable slots of a fresh [`RuntimeInstance`]
pub const DEFAULT_LOCAL_WORDS: usize = 64;

/// Heavyweight state kept in a pool slot and reused across checkouts
pub trait PooledInstance: Send + 'static {
    /// Build a fresh instance. Called once per slot, on first checkout.
    fn create() -> Self;

    /// Wipe every piece of execution state the next holder must not see.
    /// Implementations should use [`secure_zero`] so the stores survive
    /// optimisation.
    fn secure_clear(&mut self);
}

/// Zero `words` with volatile stores the optimiser cannot drop
pub fn secure_zero(words: &mut [u64]) {
    for word in words.iter_mut() {
        // SAFETY: word is a valid, aligned &mut u64
        unsafe { ptr::write_volatile(word, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Byte-wise variant of [`secure_zero`]
pub fn secure_zero_bytes(bytes: &mut [u8]) {
    for byte in bytes.iter_mut() {
        // SAFETY: byte is a valid &mut u8
        unsafe { ptr::write_volatile(byte, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Interpreter execution state: operand stack, locals, instruction pointer
#[derive(Debug)]
pub struct RuntimeInstance {
    pub stack: Box<[u64]>,
    pub stack_top: usize,
    pub locals: Box<[u64]>,
    pub local_count: usize,
    pub ip: usize,
    pub error: Option<String>,
}

impl RuntimeInstance {
    pub fn with_capacity(stack_words: usize, local_words: usize) -> Self {
        Self {
            stack: vec![0; stack_words].into_boxed_slice(),
            stack_top: 0,
            locals: vec![0; local_words].into_boxed_slice(),
            local_count: 0,
            ip: 0,
            error: None,
        }
    }

    /// Push onto the operand stack; false on overflow
    pub fn push(&mut self, value: u64) -> bool {
        match self.stack.get_mut(self.stack_top) {
            Some(slot) => {
                *slot = value;
                self.stack_top += 1;
                true
            }
            None => false,
        }
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.stack_top = self.stack_top.checked_sub(1)?;
        Some(self.stack[self.stack_top])
    }

    /// Store local `index`; false when out of range
    pub fn set_local(&mut self, index: usize, value: u64) -> bool {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                self.local_count = self.local_count.max(index + 1);
                true
            }
            None => false,
        }
    }

    pub fn local(&self, index: usize) -> Option<u64> {
        (index < self.local_count).then(|| self.locals[index])
    }

    /// No trace of a previous execution remains
    pub fn is_clear(&self) -> bool {
        self.stack_top == 0
            && self.local_count == 0
            && self.ip == 0
            && self.error.is_none()
            && self.stack.iter().all(|&w| w == 0)
            && self.locals.iter().all(|&w| w == 0)
    }
}

impl PooledInstance for RuntimeInstance {
    fn create() -> Self {
        Self::with_capacity(DEFAULT_STACK_WORDS, DEFAULT_LOCAL_WORDS)
    }

    fn secure_clear(&mut self) {
        secure_zero(&mut self.stack);
        secure_zero(&mut self.locals);
        if let Some(mut message) = self.error.take() {
            // SAFETY: zero bytes keep the string valid UTF-8
            secure_zero_bytes(unsafe { message.as_bytes_mut() });
        }
        // SAFETY: plain field stores through valid references
        unsafe {
            ptr::write_volatile(&mut self.stack_top, 0);
            ptr::write_volatile(&mut self.local_count, 0);
            ptr::write_volatile(&mut self.ip, 0);
        }
        compiler_fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_and_locals() {
        let mut vm = RuntimeInstance::with_capacity(2, 2);
        assert!(vm.push(1));
        assert!(vm.push(2));
        assert!(!vm.push(3));
        assert_eq!(vm.pop(), Some(2));
        assert!(vm.set_local(1, 9));
        assert!(!vm.set_local(2, 9));
        assert_eq!(vm.local(1), Some(9));
        assert_eq!(vm.local(0), Some(0));
    }

    #[test]
    fn test_secure_clear_wipes_everything() {
        let mut vm = RuntimeInstance::create();
        for i in 0..DEFAULT_STACK_WORDS as u64 {
            vm.push(i ^ 0xDEAD_BEEF);
        }
        vm.set_local(DEFAULT_LOCAL_WORDS - 1, u64::MAX);
        vm.ip = 4242;
        vm.error = Some("secret".to_string());
        assert!(!vm.is_clear());

        vm.secure_clear();
        assert!(vm.is_clear());
    }
}
