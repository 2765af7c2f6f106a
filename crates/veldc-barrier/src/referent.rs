//! Referent-field guard: keep-alive logging for accesses that might
//! read the referent slot of a reference-queue object.
//!
//! Used only when that cannot be decided statically (unsafe-style
//! access, non-constant offset). Two compile-time filters short-circuit
//! emission; otherwise a runtime guard narrows to the referent offset
//! and an instanceof check before logging the value through the SATB
//! pre-barrier:
//!
//! ```text
//! if offset == referent_offset:            // predicted not taken
//!     if instanceof(base, Reference):      // predicted not taken
//!         log_pre_barrier(old_value)
//!         fence                            // optional, keeps the read
//!                                          // below a collector safepoint
//! ```

use veldc_graph::{AliasIdx, BasicType, CmpKind, GraphBuilder, NodeId, Ty};

use crate::access::BarrierSet;
use crate::satb::PROB_STATE_CHANGING;

impl BarrierSet {
    /// Guard and insert a keep-alive pre-barrier for `pre_val`, the
    /// value just loaded from `base_oop` at `offset`.
    pub(crate) fn insert_pre_barrier(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        base_oop: NodeId,
        offset: NodeId,
        pre_val: NodeId,
        need_mem_bar: bool,
        alias: AliasIdx,
    ) {
        let tcx = self.tcx;

        // Constant offset that is not the referent offset: cannot be the
        // referent field.
        if let Some(con) = kit.g.find_int_con(offset) {
            if con != tcx.referent_offset {
                return;
            }
        }

        // Static type of the base rules the referent field out entirely
        // for arrays and for klasses provably outside the Reference
        // family (and not an ancestor broad enough to hide one).
        if let Some(rt) = kit.g.ty(base_oop).ref_ty() {
            if let Some(kid) = rt.klass {
                let info = &kit.g.klasses[kid];
                if info.is_array() {
                    return;
                }
                if !info.can_be_reference_family() {
                    return;
                }
            }
        }

        // The compile-time filters did not reject the access; emit the
        // runtime filters.
        let referent_off = kit.con_int(tcx.referent_offset);
        let at_referent = kit.cmp(CmpKind::Eq, offset, referent_off);

        let outer = kit.save_state();
        let (off_t, off_f) = kit.if_then_else(at_referent, PROB_STATE_CHANGING);
        kit.set_ctrl(off_t);
        {
            match self.reference_klass {
                Some(ref_klass) => {
                    let is_instof = kit.instance_of(base_oop, ref_klass);
                    let one = kit.con_int(1);
                    let instof_hit = kit.cmp(CmpKind::Eq, is_instof, one);

                    let before_instof = kit.save_state();
                    let (inst_t, inst_f) = kit.if_then_else(instof_hit, PROB_STATE_CHANGING);
                    kit.set_ctrl(inst_t);
                    {
                        self.log_keep_alive(kit, pre_val, need_mem_bar, alias);
                    }
                    let hit_state = kit.save_state();
                    kit.restore_state(before_instof.with_ctrl(inst_f));
                    let miss_state = kit.save_state();
                    kit.merge(hit_state, miss_state);
                }
                None => {
                    // No resolved Reference klass in this env: keep the
                    // guard conservative and log under the offset check
                    // alone.
                    self.log_keep_alive(kit, pre_val, need_mem_bar, alias);
                }
            }
        }
        let guard_state = kit.save_state();
        kit.restore_state(outer.with_ctrl(off_f));
        let skip_state = kit.save_state();
        kit.merge(guard_state, skip_state);
    }

    fn log_keep_alive(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        pre_val: NodeId,
        need_mem_bar: bool,
        alias: AliasIdx,
    ) {
        let top = kit.top();
        self.satb_write_barrier_pre(
            kit,
            false,
            top,
            top,
            alias,
            Ty::Ref(veldc_graph::RefTy::BOTTOM),
            pre_val,
            BasicType::Ref,
        );
        if need_mem_bar {
            // Keep the referent read from being hoisted or commoned
            // across a safepoint where the collector may clear it.
            kit.mem_bar(alias);
        }
    }
}
