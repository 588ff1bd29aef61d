#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::collections::HashMap;

    use libtaint::{
        Taint, TaintOptions,
        instr::{Instr, MemRef, Opcode, Registers},
        propagate::{Emitter, MetaInstr, Scratch},
        regs::Reg,
    };
    use libtaint_aslr::{AslrGuard, AslrOptions, SyscallNumber, SyscallVerdict, TaintClass};
    use serial_test::serial;
    use spin::{Lazy, Mutex};

    static INIT_ONCE: Lazy<Mutex<()>> = Lazy::new(|| {
        {
            env_logger::init();
        };
        Mutex::new(())
    });

    fn guard(options: AslrOptions) -> AslrGuard {
        drop(INIT_ONCE.lock());
        let taint = Taint::init(7, TaintOptions::builder().track_pc(true).build()).unwrap();
        AslrGuard::new(taint, options)
    }

    #[derive(Debug, Default)]
    struct Buffer {
        held: u8,
        code: Vec<MetaInstr>,
    }

    impl Emitter for Buffer {
        type Error = ();

        fn reserve_scratch(&mut self) -> Result<Scratch, ()> {
            self.held += 1;
            Ok(Scratch(self.held - 1))
        }

        fn release_scratch(&mut self, _scratch: Scratch) -> Result<(), ()> {
            self.held -= 1;
            Ok(())
        }

        fn insert(&mut self, meta: MetaInstr) -> Result<(), ()> {
            self.code.push(meta);
            Ok(())
        }
    }

    #[test]
    #[serial]
    fn test_stack_pointer_leak() {
        let guard = guard(AslrOptions::default());
        let taint = guard.taint();
        let mut thread = guard.on_thread_init().unwrap();
        let mut regs = Registers::new();
        regs.set(Reg::R1, 0x0001_0000);

        // mov r0, sp; str r0, [r1]
        let mov = Instr::new(Opcode::Mov).dst(Reg::R0).src(Reg::SP);
        taint.propagate(&mut thread, &mov, &regs).unwrap();
        let store = Instr::new(Opcode::Str)
            .dst(MemRef::base(Reg::R1))
            .src(Reg::R0);
        taint.propagate(&mut thread, &store, &regs).unwrap();

        let verdict = guard
            .on_pre_syscall(SyscallNumber::Write.into(), 0x0001_0000, 16)
            .unwrap();
        let SyscallVerdict::Leak(leak) = verdict else {
            panic!("expected a leak, got {verdict:?}");
        };
        assert_eq!(leak.class(), Some(TaintClass::Stack));
        assert_eq!(leak.addr, 0x0001_0000);
    }

    #[test]
    #[serial]
    fn test_clean_buffer_is_allowed() {
        let guard = guard(AslrOptions::default());
        assert_eq!(
            guard
                .on_pre_syscall(SyscallNumber::Send.into(), 0x0002_0000, 64)
                .unwrap(),
            SyscallVerdict::Allow
        );
        // Not an output system call
        guard.taint().set_mem_taint(0x0002_0000, 0x41).unwrap();
        assert_eq!(
            guard.on_pre_syscall(3, 0x0002_0000, 64).unwrap(),
            SyscallVerdict::Allow
        );
    }

    #[test]
    #[serial]
    fn test_fail_address_leaks() {
        let guard = guard(AslrOptions::builder().fail_address_leaks(true).build());
        guard.taint().set_mem_taint(0x0003_0008, 0x43).unwrap();
        let verdict = guard
            .on_pre_syscall(SyscallNumber::Send.into(), 0x0003_0006, 4)
            .unwrap();
        assert!(matches!(verdict, SyscallVerdict::Fail(leak) if leak.addr == 0x0003_0008));
    }

    #[test]
    #[serial]
    fn test_heap_address_from_mmap2() {
        let guard = guard(AslrOptions::default());
        let mut thread = guard.on_thread_init().unwrap();
        guard
            .on_post_syscall(&mut thread, SyscallNumber::Mmap2.into(), false)
            .unwrap();
        assert_eq!(guard.taint().get_reg_taint(&thread, Reg::R0).unwrap(), 0);
        guard
            .on_post_syscall(&mut thread, SyscallNumber::Mmap2.into(), true)
            .unwrap();
        assert_eq!(
            guard.taint().get_reg_taint(&thread, Reg::R0).unwrap(),
            u8::from(TaintClass::Heap)
        );
    }

    #[test]
    #[serial]
    fn test_pc_relative_address() {
        let guard = guard(AslrOptions::default());
        let taint = guard.taint();
        let mut thread = guard.on_thread_init().unwrap();
        let add = Instr::new(Opcode::Add)
            .dst(Reg::R3)
            .src(Reg::PC)
            .src(16_i64);
        guard.on_pc_read(&mut thread, &add).unwrap();
        taint.propagate(&mut thread, &add, &Registers::new()).unwrap();
        assert_eq!(
            taint.get_reg_taint(&thread, Reg::R3).unwrap(),
            u8::from(TaintClass::Text)
        );

        let mut buffer = Buffer::default();
        guard.instrument_pc_read(&add, &mut buffer).unwrap();
        assert_eq!(buffer.held, 0);
        assert_eq!(buffer.code.len(), 3);
        let mov = Instr::new(Opcode::Mov).dst(Reg::R0).src(Reg::R1);
        let mut buffer = Buffer::default();
        guard.instrument_pc_read(&mov, &mut buffer).unwrap();
        assert!(buffer.code.is_empty());
    }

    #[test]
    #[serial]
    fn test_initial_stack() {
        let guard = guard(AslrOptions::default());
        let sp = 0x0ff0_0000;
        // argc, argv[0..2], null, envp[0], null
        let stack: HashMap<usize, u32> = [
            (sp, 2),
            (sp + 4, 0x0ff0_1000),
            (sp + 8, 0x0ff0_1010),
            (sp + 12, 0),
            (sp + 16, 0x0ff0_1020),
            (sp + 20, 0),
        ]
        .into_iter()
        .collect();
        guard.on_entry(sp, |addr| stack.get(&addr).copied()).unwrap();
        let taint = guard.taint();
        assert_eq!(taint.get_mem_taint(sp).unwrap(), 0);
        assert_eq!(taint.get_mem_taint(sp + 4).unwrap(), 0x41);
        assert_eq!(taint.get_mem_taint(sp + 8).unwrap(), 0x41);
        assert_eq!(taint.get_mem_taint(sp + 12).unwrap(), 0);
        assert_eq!(taint.get_mem_taint(sp + 16).unwrap(), 0x41);
        assert_eq!(taint.get_mem_taint(sp + 20).unwrap(), 0);
    }

    #[test]
    #[serial]
    fn test_dump_on_finish() {
        let path = std::env::temp_dir().join(format!("libtaint-aslr-{}", std::process::id()));
        let guard = guard(AslrOptions::builder().dump_taint_on_exit(path.clone()).build());
        guard.taint().set_mem_taint(0x0004_0000, 0x42).unwrap();
        guard.finish().unwrap();
        assert!(!Taint::is_initialized());
        let dump = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(dump.starts_with(b"TAINT DUMP\n"));
    }
}
